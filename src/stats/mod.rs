use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// 索引运行计数（原子、可跨线程共享；由 `Arc` 注入，不用进程级静态量）
#[derive(Debug, Default)]
pub struct IndexStats {
    /// insert_span 调用次数
    pub spans: AtomicU64,
    /// 被已有区间吸收（含完全包含）
    pub extends: AtomicU64,
    /// 新建区间
    pub creates: AtomicU64,
    /// 合并（插入时桥接 + consolidate）
    pub merges: AtomicU64,
    /// 跨日扩展被拒
    pub day_rejects: AtomicU64,
    /// 落库：insert / update / delete
    pub inserts: AtomicU64,
    pub writes: AtomicU64,
    pub deletes: AtomicU64,
    pub write_failures: AtomicU64,
    /// 行已被外部清理，转入 out-of-scope
    pub vanished: AtomicU64,
    pub purged: AtomicU64,
    pub archived: AtomicU64,
}

impl IndexStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn report(&self, tag: &str, size: usize, alerts_suppressed: u64) -> StatsReport {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsReport {
            tag: tag.to_string(),
            size,
            spans: get(&self.spans),
            extends: get(&self.extends),
            creates: get(&self.creates),
            merges: get(&self.merges),
            day_rejects: get(&self.day_rejects),
            inserts: get(&self.inserts),
            writes: get(&self.writes),
            deletes: get(&self.deletes),
            write_failures: get(&self.write_failures),
            vanished: get(&self.vanished),
            purged: get(&self.purged),
            archived: get(&self.archived),
            alerts_suppressed,
        }
    }
}

/// 某一时刻的统计快照
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatsReport {
    pub tag: String,
    pub size: usize,
    pub spans: u64,
    pub extends: u64,
    pub creates: u64,
    pub merges: u64,
    pub day_rejects: u64,
    pub inserts: u64,
    pub writes: u64,
    pub deletes: u64,
    pub write_failures: u64,
    pub vanished: u64,
    pub purged: u64,
    pub archived: u64,
    pub alerts_suppressed: u64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║ holdings index {:>33} ║", self.tag)?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ holdings in memory: {:>28} ║", self.size)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Ingest:                                          ║")?;
        writeln!(f, "║   spans:        {:>10}                       ║", self.spans)?;
        writeln!(f, "║   extends:      {:>10}                       ║", self.extends)?;
        writeln!(f, "║   creates:      {:>10}                       ║", self.creates)?;
        writeln!(f, "║   merges:       {:>10}                       ║", self.merges)?;
        writeln!(f, "║   day rejects:  {:>10}                       ║", self.day_rejects)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Store:                                           ║")?;
        writeln!(f, "║   inserts:      {:>10}                       ║", self.inserts)?;
        writeln!(f, "║   updates:      {:>10}                       ║", self.writes)?;
        writeln!(f, "║   deletes:      {:>10}                       ║", self.deletes)?;
        writeln!(f, "║   failures:     {:>10}                       ║", self.write_failures)?;
        writeln!(f, "║   vanished:     {:>10}                       ║", self.vanished)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Maintenance:                                     ║")?;
        writeln!(f, "║   purged:       {:>10}                       ║", self.purged)?;
        writeln!(f, "║   archived:     {:>10}                       ║", self.archived)?;
        writeln!(f, "║   alerts muted: {:>10}                       ║", self.alerts_suppressed)?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reads_counters() {
        let s = IndexStats::default();
        IndexStats::bump(&s.spans);
        IndexStats::bump(&s.spans);
        IndexStats::add(&s.purged, 5);
        let r = s.report("live", 3, 1);
        assert_eq!(r.spans, 2);
        assert_eq!(r.purged, 5);
        assert_eq!(r.size, 3);
        let text = r.to_string();
        assert!(text.contains("live"));
        assert!(text.contains("purged"));
    }
}
