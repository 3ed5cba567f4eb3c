use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 网关错误。`Backend` 视为瞬时错误（断线 / 语句失败），允许一次强制重连重试。
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("gateway closed")]
    Closed,

    #[error("invalid table name {0:?}")]
    InvalidTable(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Backend(_))
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Backend(e.to_string())
    }
}

/// 持久化行。时间统一为 epoch 毫秒；`day` 为自 epoch 起的天数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingRow {
    pub id: i64,
    pub channel: String,
    pub kind: String,
    pub start: i64,
    pub end: i64,
    pub day: i32,
}

/// 关系库网关：单行往返 + 批量归档。
///
/// ## 契约
/// - 一个实例绑定一张表（`table()`），多个实例可指向 live/history/archive 不同表共存。
/// - update/delete 返回受影响行数；0 表示行已不存在，由调用方决定是否告警。
/// - 实现内部负责加锁与重连重试（见 `RetryPolicy`），调用方不做 sleep-retry。
pub trait Gateway: Send + Sync {
    fn table(&self) -> &str;

    /// 插入新行，返回生成的 id（忽略 `row.id`）
    fn insert(&self, row: &HoldingRow) -> Result<i64, GatewayError>;

    fn update_start(&self, id: i64, start: i64) -> Result<usize, GatewayError>;

    fn update_end(&self, id: i64, end: i64) -> Result<usize, GatewayError>;

    fn update_both(&self, id: i64, start: i64, end: i64) -> Result<usize, GatewayError>;

    fn delete(&self, id: i64) -> Result<usize, GatewayError>;

    fn select_by_id(&self, id: i64) -> Result<Option<HoldingRow>, GatewayError>;

    fn exists_by_id(&self, id: i64) -> Result<bool, GatewayError> {
        Ok(self.select_by_id(id)?.is_some())
    }

    /// end >= since_ms 的全部行（启动装载用）
    fn select_since(&self, since_ms: i64) -> Result<Vec<HoldingRow>, GatewayError>;

    /// 把 ids 对应的行复制到 `dest_table` 后从本表删除，返回搬迁行数
    fn copy_then_delete(&self, dest_table: &str, ids: &[i64]) -> Result<usize, GatewayError>;
}

/// 表名会拼进 SQL，只允许标识符字符
pub fn validate_table_name(name: &str) -> Result<(), GatewayError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("static table pattern"));
    if re.is_match(name) {
        Ok(())
    } else {
        Err(GatewayError::InvalidTable(name.to_string()))
    }
}
