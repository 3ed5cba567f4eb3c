use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub const DEFAULT_ALERT_INTERVAL: Duration = Duration::from_secs(2 * 3600);

/// 告警类别：同类告警在窗口期内只发一次
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlertClass {
    /// 写回失败（重试后仍失败）
    PersistFailed,
    /// 行丢失，但时间还不够老，不应被外部清理
    RowMissing,
    /// 结构不变量被破坏 / 坏行
    Invariant,
    /// 归档搬迁失败
    ArchiveFailed,
}

impl AlertClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertClass::PersistFailed => "persist-failed",
            AlertClass::RowMissing => "row-missing",
            AlertClass::Invariant => "invariant",
            AlertClass::ArchiveFailed => "archive-failed",
        }
    }
}

/// 限流告警器：每个类别 `interval` 内最多上报一次，其余计数后降级为 debug。
pub struct AlertLimiter {
    interval: Duration,
    last_fired: DashMap<AlertClass, Instant>,
    suppressed: AtomicU64,
}

impl AlertLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: DashMap::new(),
            suppressed: AtomicU64::new(0),
        }
    }

    /// 返回 true 表示本次真正上报
    pub fn raise(&self, class: AlertClass, msg: &str) -> bool {
        let now = Instant::now();
        let fire = match self.last_fired.entry(class) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) >= self.interval {
                    e.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        };

        if fire {
            tracing::error!("ALERT [{}] {}", class.as_str(), msg);
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("alert suppressed [{}] {}", class.as_str(), msg);
        }
        fire
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl Default for AlertLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_INTERVAL)
    }
}
