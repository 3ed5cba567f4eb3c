use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::error::HoldingError;

/// 通道键的固定宽度：NN SSSSS CCC LL
pub const CHANNEL_LEN: usize = 12;

// network(2) + station(5) + channel(3) + location(2)；空格补齐
fn channel_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Z0-9][A-Z0-9 ][A-Z0-9][A-Z0-9 ]{4}[A-Z0-9]{3}[A-Z0-9 \-]{2}$")
            .expect("static channel pattern")
    })
}

/// 通道键（network/station/channel/location），按字节序比较。
///
/// 10~12 字符的输入会在尾部补空格到 12 字节；构造即校验，非法输入一律拒绝。
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel([u8; CHANNEL_LEN]);

impl Channel {
    pub fn parse(s: &str) -> Result<Self, HoldingError> {
        if !s.is_ascii() || s.len() < 10 || s.len() > CHANNEL_LEN {
            return Err(HoldingError::InvalidChannel(s.to_string()));
        }
        let mut raw = [b' '; CHANNEL_LEN];
        raw[..s.len()].copy_from_slice(s.as_bytes());
        let padded = std::str::from_utf8(&raw).map_err(|_| HoldingError::InvalidChannel(s.to_string()))?;
        if !channel_pattern().is_match(padded) {
            return Err(HoldingError::InvalidChannel(s.to_string()));
        }
        Ok(Self(raw))
    }

    /// 仅用于占位（scratch）：首字节为空格，任何合法通道都不会与之相等。
    pub(crate) const fn blank() -> Self {
        Self([b' '; CHANNEL_LEN])
    }

    pub fn as_str(&self) -> &str {
        // 构造时已保证 ASCII
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    pub fn network(&self) -> &str {
        self.as_str()[0..2].trim_end()
    }

    pub fn station(&self) -> &str {
        self.as_str()[2..7].trim_end()
    }

    /// SEED band code（通道代码首字母）
    pub fn band(&self) -> u8 {
        self.0[7]
    }

    /// 合并容差（毫秒）：约 1.1 个采样间隔，按 band 粗分档。
    pub fn tolerance_ms(&self) -> i64 {
        match self.band() {
            // >= 80 Hz
            b'F' | b'G' | b'D' | b'C' | b'E' | b'H' => 25,
            // 10 ~ 80 Hz
            b'S' | b'B' => 55,
            b'M' => 550,
            b'L' => 1_100,
            b'V' | b'U' | b'R' | b'P' | b'T' | b'Q' => 11_000,
            _ => 1_100,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({:?})", self.as_str())
    }
}

/// 数据来源类型：两字符代码
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceType([u8; 2]);

impl SourceType {
    pub fn parse(s: &str) -> Result<Self, HoldingError> {
        let b = s.as_bytes();
        if b.len() != 2 || !b.iter().all(|c| c.is_ascii_alphanumeric()) {
            return Err(HoldingError::InvalidSourceType(s.to_string()));
        }
        Ok(Self([b[0], b[1]]))
    }

    pub(crate) const fn blank() -> Self {
        Self([b' '; 2])
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceType({:?})", self.as_str())
    }
}
