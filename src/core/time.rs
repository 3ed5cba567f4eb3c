use std::fmt;

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::core::error::HoldingError;

pub const MS_PER_DAY: i64 = 86_400_000;

/// 超过“当前 + 20 年”的时间戳视为时钟错误
const MAX_FUTURE_MS: i64 = 20 * 366 * MS_PER_DAY;

/// 当前墙钟时间（epoch 毫秒）
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 校验时间戳落在合理区间：不早于 epoch，不晚于几十年后。
pub fn validate_time(ms: i64) -> Result<(), HoldingError> {
    if ms < 0 || ms > now_ms().saturating_add(MAX_FUTURE_MS) {
        return Err(HoldingError::TimeOutOfRange { time: ms });
    }
    Ok(())
}

/// 人类可读的 UTC 时间（用于日志 / dump）
pub fn fmt_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// 日历日分区键（UTC，自 epoch 起的天数）
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(i32);

impl DayKey {
    pub fn of(ms: i64) -> Self {
        Self(ms.div_euclid(MS_PER_DAY) as i32)
    }

    pub fn from_days(days: i32) -> Self {
        Self(days)
    }

    pub fn days(self) -> i32 {
        self.0
    }

    /// 该日 00:00:00.000 的 epoch 毫秒
    pub fn start_ms(self) -> i64 {
        self.0 as i64 * MS_PER_DAY
    }

    /// 次日 00:00:00.000；本日区间的 end 不得超过它
    pub fn end_ms(self) -> i64 {
        self.start_ms() + MS_PER_DAY
    }

    pub fn date(self) -> Option<NaiveDate> {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
        if self.0 >= 0 {
            epoch.checked_add_days(Days::new(self.0 as u64))
        } else {
            epoch.checked_sub_days(Days::new(self.0.unsigned_abs() as u64))
        }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date() {
            Some(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            None => write!(f, "day#{}", self.0),
        }
    }
}
