pub mod stream;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::core::{Channel, HoldingError, SourceType};

pub use stream::{SpanStream, StreamSummary};

/// 一条观测：某 channel 从 `time` 起收到 `duration_ms` 的数据
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanEvent {
    pub channel: Channel,
    pub kind: SourceType,
    pub time: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Error)]
pub enum SpanParseError {
    #[error("expected 4 '|'-separated fields, got {0}")]
    FieldCount(usize),

    #[error("field {field} is not an integer: {value:?}")]
    Number { field: &'static str, value: String },

    #[error(transparent)]
    Invalid(#[from] HoldingError),
}

/// 行格式：`CHANNEL|TYPE|epoch_ms|duration_ms`（channel 内部空格保留）
impl FromStr for SpanEvent {
    type Err = SpanParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 4 {
            return Err(SpanParseError::FieldCount(fields.len()));
        }
        let number = |field: &'static str, raw: &str| {
            raw.trim().parse::<i64>().map_err(|_| SpanParseError::Number {
                field,
                value: raw.to_string(),
            })
        };
        Ok(Self {
            channel: Channel::parse(fields[0])?,
            kind: SourceType::parse(fields[1].trim())?,
            time: number("epoch_ms", fields[2])?,
            duration_ms: number("duration_ms", fields[3])?,
        })
    }
}

impl fmt::Display for SpanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.channel, self.kind, self.time, self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line() {
        let ev: SpanEvent = "USAAA  BHZ00|AA|1700006400000|10000\r\n".parse().unwrap();
        assert_eq!(ev.channel.as_str(), "USAAA  BHZ00");
        assert_eq!(ev.kind.as_str(), "AA");
        assert_eq!(ev.time, 1_700_006_400_000);
        assert_eq!(ev.duration_ms, 10_000);
        assert_eq!(ev.to_string(), "USAAA  BHZ00|AA|1700006400000|10000");
    }

    #[test]
    fn short_channel_is_padded() {
        let ev: SpanEvent = "XXCCC  HHZ|ZZ|0|1".parse().unwrap();
        assert_eq!(ev.channel.as_str(), "XXCCC  HHZ  ");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            "USAAA  BHZ00|AA|1".parse::<SpanEvent>(),
            Err(SpanParseError::FieldCount(3))
        ));
        assert!(matches!(
            "USAAA  BHZ00|AA|soon|10".parse::<SpanEvent>(),
            Err(SpanParseError::Number { field: "epoch_ms", .. })
        ));
        assert!(matches!(
            "bad|AA|1|1".parse::<SpanEvent>(),
            Err(SpanParseError::Invalid(HoldingError::InvalidChannel(_)))
        ));
    }
}
