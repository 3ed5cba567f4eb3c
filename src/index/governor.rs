use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::core::{AlertClass, Channel, DayKey};
use crate::index::holding::{Holding, PersistOutcome};
use crate::index::holdings::HoldingIndex;
use crate::stats::IndexStats;
use crate::storage::Gateway;

/// 超过该长度的区间无论排名都保留
pub const DEFAULT_KEEP_FLOOR: Duration = Duration::from_secs(120);
/// 某天区间数超过 target × factor 才触发降级
pub const DEFAULT_EXCESS_FACTOR: usize = 5;

const ARCHIVE_CHUNK: usize = 500;

/// 容量调节：把碎片化严重的 (channel, day) 中最短的区间挪到归档表。
#[derive(Clone, Debug)]
pub struct CapacityGovernor {
    target_per_day: usize,
    keep_floor_ms: i64,
    excess_factor: usize,
    archive_table: String,
}

impl CapacityGovernor {
    pub fn new(target_per_day: usize, archive_table: &str) -> Self {
        Self {
            target_per_day,
            keep_floor_ms: DEFAULT_KEEP_FLOOR.as_millis() as i64,
            excess_factor: DEFAULT_EXCESS_FACTOR,
            archive_table: archive_table.to_string(),
        }
    }

    pub fn with_keep_floor(mut self, floor: Duration) -> Self {
        self.keep_floor_ms = floor.as_millis() as i64;
        self
    }

    pub fn with_excess_factor(mut self, factor: usize) -> Self {
        self.excess_factor = factor.max(1);
        self
    }

    pub fn archive_table(&self) -> &str {
        &self.archive_table
    }

    /// 用索引自己的网关执行一轮
    pub fn run(&self, index: &HoldingIndex) -> usize {
        self.apply(index, index.store().gateway())
    }

    /// 挑出应降级的区间下标（升序）。
    ///
    /// 按 (channel, day) 分组；组内数量超过阈值时，保留最长的 `target_per_day`
    /// 个以及所有长于 keep floor 的，其余为候选。
    pub fn select_victims(&self, holdings: &[Holding]) -> Vec<usize> {
        if self.target_per_day == 0 {
            return Vec::new();
        }
        let threshold = self.target_per_day.saturating_mul(self.excess_factor);

        let mut groups: HashMap<(Channel, DayKey), Vec<usize>> = HashMap::new();
        for (i, h) in holdings.iter().enumerate() {
            groups.entry((h.channel(), h.day())).or_default().push(i);
        }

        let keep = self.target_per_day;
        let floor = self.keep_floor_ms;
        let mut victims: Vec<usize> = groups
            .into_par_iter()
            .filter(|(_, members)| members.len() > threshold)
            .flat_map_iter(move |(_, mut members)| {
                members.sort_by_key(|&i| Reverse(holdings[i].len_ms()));
                members
                    .into_iter()
                    .skip(keep)
                    .filter(move |&i| holdings[i].len_ms() <= floor)
            })
            .collect();
        victims.sort_unstable();
        victims
    }

    fn apply(&self, index: &HoldingIndex, gateway: &dyn Gateway) -> usize {
        let started = Instant::now();
        let tag = index.tag();
        let store = index.store();
        let mut guard = index.state.write();
        let st = &mut *guard;

        let victims = self.select_victims(&st.holdings);
        if victims.is_empty() {
            return 0;
        }

        // 先写回脏区间，归档行必须是最终边界；写失败的留到下一轮
        let mut movable: Vec<(usize, i64)> = Vec::with_capacity(victims.len());
        for &i in &victims {
            let h = &mut st.holdings[i];
            match h.persist(store) {
                PersistOutcome::Failed | PersistOutcome::Missing => continue,
                PersistOutcome::OutOfScope => movable.push((i, 0)),
                PersistOutcome::Clean | PersistOutcome::Written => movable.push((i, h.id())),
            }
        }

        let mut removed: Vec<usize> = movable
            .iter()
            .filter(|(_, id)| *id == 0)
            .map(|(i, _)| *i)
            .collect();
        let mut moved = 0usize;
        let with_rows: Vec<(usize, i64)> = movable.into_iter().filter(|(_, id)| *id > 0).collect();
        for chunk in with_rows.chunks(ARCHIVE_CHUNK) {
            let ids: Vec<i64> = chunk.iter().map(|(_, id)| *id).collect();
            match gateway.copy_then_delete(&self.archive_table, &ids) {
                Ok(n) => {
                    moved += n;
                    removed.extend(chunk.iter().map(|(i, _)| *i));
                }
                Err(e) => {
                    store.alerts().raise(
                        AlertClass::ArchiveFailed,
                        &format!(
                            "[{}] archiving {} holdings to {} failed: {}",
                            tag,
                            ids.len(),
                            self.archive_table,
                            e
                        ),
                    );
                }
            }
        }

        removed.sort_unstable();
        for &i in removed.iter().rev() {
            st.remove(i);
        }
        IndexStats::add(&store.stats().archived, moved);
        index.size.store(st.holdings.len(), Ordering::Relaxed);

        tracing::info!(
            "[{}] archived {} of {} excess holdings to {} in {:?}",
            tag,
            moved,
            victims.len(),
            self.archive_table,
            started.elapsed()
        );
        removed.len()
    }
}

impl HoldingIndex {
    /// 按天降级碎片区间到归档表，返回移出内存的区间数
    pub fn move_excess_to_archive(
        &self,
        target_per_day: usize,
        gateway: &dyn Gateway,
        archive_table: &str,
    ) -> usize {
        CapacityGovernor::new(target_per_day, archive_table).apply(self, gateway)
    }
}
