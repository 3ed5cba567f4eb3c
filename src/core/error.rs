use thiserror::Error;

use crate::storage::GatewayError;

/// 索引层错误：校验错误同步返回，网关错误原样透传
#[derive(Debug, Error)]
pub enum HoldingError {
    #[error("invalid channel {0:?}")]
    InvalidChannel(String),

    #[error("invalid source type {0:?}")]
    InvalidSourceType(String),

    #[error("timestamp {time} outside sane range")]
    TimeOutOfRange { time: i64 },

    #[error("negative duration {0}ms")]
    NegativeDuration(i64),

    #[error("span end {end} precedes start {start}")]
    InvertedSpan { start: i64, end: i64 },

    #[error("span {start}..{end} crosses a day boundary")]
    CrossesDay { start: i64, end: i64 },

    #[error("index is closed")]
    Closed,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type Result<T> = std::result::Result<T, HoldingError>;
