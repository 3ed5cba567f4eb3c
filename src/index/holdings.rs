use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::core::{now_ms, AlertClass, Channel, HoldingError, Result, SourceType};
use crate::index::holding::{day_pieces, span_end, Holding, HoldingStore, PersistOutcome};
use crate::query::matcher::{create_matcher, ChannelMatcher};
use crate::stats::{IndexStats, StatsReport};

/// 容量按固定块增长（不翻倍），插入时尾部平移的最坏代价可预期
pub const DEFAULT_GROW_CHUNK: usize = 1000;

const PROGRESS_EVERY: Duration = Duration::from_secs(1);

/// `insert_span` 的落点
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// 被已有区间吸收（扩展或完全包含）
    Extended,
    /// 新建区间
    Created,
}

pub(super) struct IndexState {
    pub(super) holdings: Vec<Holding>,
    /// 写回调度器的轮转游标
    pub(super) cursor: usize,
    scratch: Holding,
    /// 合并时删行失败的 id，等维护调用重删
    orphans: Vec<i64>,
    defer: bool,
    closed: bool,
}

impl IndexState {
    /// 移除并保持游标指向同一个“下一个”元素
    pub(super) fn remove(&mut self, idx: usize) -> Holding {
        let h = self.holdings.remove(idx);
        if self.cursor > idx {
            self.cursor -= 1;
        }
        h
    }
}

/// 区间索引：按 (channel, type, start) 排序的单一数组。
///
/// 所有结构性修改（插入 / 合并 / 清理 / 写回 / 关闭）都在同一把写锁内完成；
/// 只读查询取读锁，`size()` 无锁。
pub struct HoldingIndex {
    pub(super) state: RwLock<IndexState>,
    pub(super) store: HoldingStore,
    pub(super) size: AtomicUsize,
    grow_chunk: usize,
    tag: ArcSwap<String>,
}

impl HoldingIndex {
    pub fn new(store: HoldingStore) -> Self {
        Self {
            state: RwLock::new(IndexState {
                holdings: Vec::new(),
                cursor: 0,
                scratch: Holding::scratch(),
                orphans: Vec::new(),
                defer: false,
                closed: false,
            }),
            store,
            size: AtomicUsize::new(0),
            grow_chunk: DEFAULT_GROW_CHUNK,
            tag: ArcSwap::from_pointee("holdings".to_string()),
        }
    }

    pub fn with_grow_chunk(mut self, chunk: usize) -> Self {
        self.grow_chunk = chunk.max(1);
        self
    }

    pub fn with_tag(self, tag: &str) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn store(&self) -> &HoldingStore {
        &self.store
    }

    /// 记录一段新观测：优先扩展同 key 的已有区间，否则新建。
    ///
    /// 日界模式下跨零点的 span 按天拆开，各段落到各自日的区间。
    pub fn insert_span(
        &self,
        channel: &str,
        kind: &str,
        time: i64,
        duration_ms: i64,
    ) -> Result<Placement> {
        let channel = Channel::parse(channel)?;
        let kind = SourceType::parse(kind)?;
        let end = span_end(time, duration_ms)?;
        IndexStats::bump(&self.store.stats().spans);

        let mut guard = self.state.write();
        let st = &mut *guard;
        if st.closed {
            return Err(HoldingError::Closed);
        }

        let mut placement = Placement::Extended;
        for (from, to) in day_pieces(time, end, self.store.day_bound()) {
            if self.place(st, channel, kind, from, to)? == Placement::Created {
                placement = Placement::Created;
            }
        }

        self.size.store(st.holdings.len(), Ordering::Relaxed);
        Ok(placement)
    }

    fn place(
        &self,
        st: &mut IndexState,
        channel: Channel,
        kind: SourceType,
        time: i64,
        end: i64,
    ) -> Result<Placement> {
        let duration_ms = end - time;
        let stats = self.store.stats();
        st.scratch.reload(channel, kind, time, end);
        let pos = st
            .holdings
            .partition_point(|h| h.key_cmp(&st.scratch).is_lt());

        // 回退到同 key run 的首元素（同 key 可以有多个区间）
        let mut i = pos;
        while i > 0 && st.holdings[i - 1].same_key(&st.scratch) {
            i -= 1;
        }

        let mut accepted = None;
        while i < st.holdings.len() && st.holdings[i].same_key(&st.scratch) {
            let h = &mut st.holdings[i];
            if h.start() > end + h.tolerance() {
                break;
            }
            if h.try_extend(time, duration_ms, &self.store) {
                accepted = Some(i);
                break;
            }
            i += 1;
        }

        match accepted {
            Some(idx) => {
                IndexStats::bump(&stats.extends);
                self.settle(st, idx);
                Ok(Placement::Extended)
            }
            None => {
                let h = Holding::create(channel, kind, time, duration_ms, st.defer, &self.store)?;
                if st.holdings.len() == st.holdings.capacity() {
                    st.holdings.reserve_exact(self.grow_chunk);
                }
                st.holdings.insert(pos, h);
                if st.cursor > pos {
                    st.cursor += 1;
                }
                IndexStats::bump(&stats.creates);
                Ok(Placement::Created)
            }
        }
    }

    /// 扩展后恢复顺序，并吞并因此变得相邻 / 重叠的左右邻居（桥接缺口）
    fn settle(&self, st: &mut IndexState, mut idx: usize) {
        while idx > 0 && st.holdings[idx - 1] > st.holdings[idx] {
            st.holdings.swap(idx - 1, idx);
            idx -= 1;
        }

        while idx > 0 {
            let (left, right) = st.holdings.split_at_mut(idx);
            let prev = &left[idx - 1];
            let cur = &mut right[0];
            if !prev.same_key(cur) || prev.end() + prev.tolerance() < cur.start() {
                break;
            }
            if !cur.try_extend(prev.start(), prev.len_ms(), &self.store) {
                break;
            }
            self.discard(st, idx - 1);
            IndexStats::bump(&self.store.stats().merges);
            idx -= 1;
        }

        while idx + 1 < st.holdings.len() {
            let (left, right) = st.holdings.split_at_mut(idx + 1);
            let cur = &mut left[idx];
            let next = &right[0];
            if !cur.same_key(next) || next.start() > cur.end() + cur.tolerance() {
                break;
            }
            if !cur.try_extend(next.start(), next.len_ms(), &self.store) {
                break;
            }
            self.discard(st, idx + 1);
            IndexStats::bump(&self.store.stats().merges);
        }
    }

    /// 移除被吸收的区间并删其后备行；删失败则记下 id，由 keep_writing / purge 重删
    fn discard(&self, st: &mut IndexState, idx: usize) {
        let mut gone = st.remove(idx);
        if !gone.delete(&self.store) {
            st.orphans.push(gone.id());
        }
    }

    /// 重删合并遗留的行，遇到第一次失败即停（网关多半仍不可用）
    fn retry_orphans(&self, st: &mut IndexState) -> usize {
        let mut done = 0usize;
        while let Some(&id) = st.orphans.last() {
            match self.store.gateway().delete(id) {
                Ok(_) => {
                    st.orphans.pop();
                    IndexStats::bump(&self.store.stats().deletes);
                    done += 1;
                }
                Err(e) => {
                    IndexStats::bump(&self.store.stats().write_failures);
                    self.store.alerts().raise(
                        AlertClass::PersistFailed,
                        &format!("[{}] delete of merged row {} failed: {}", self.tag(), id, e),
                    );
                    break;
                }
            }
        }
        if done > 0 {
            tracing::debug!("[{}] deleted {} rows left over from merges", self.tag(), done);
        }
        done
    }

    /// 合并因乱序到达而重叠 / 相邻的同 key 区间，返回合并次数。
    ///
    /// `max_merges` 为 0 表示不限；调用方循环调用直到返回 0。
    /// `assume_ordered` 时候选起点超过锚点 end+tolerance 即停止内层扫描。
    pub fn consolidate(&self, max_merges: usize, assume_ordered: bool) -> usize {
        let mut guard = self.state.write();
        let st = &mut *guard;
        let tag = self.tag();
        let started = Instant::now();
        let mut last_log = started;
        let mut merges = 0usize;
        let limit_hit = |m: usize| max_merges > 0 && m >= max_merges;

        let mut i = 0;
        'outer: while i < st.holdings.len() {
            let mut j = i + 1;
            while j < st.holdings.len() {
                if limit_hit(merges) {
                    break 'outer;
                }
                let (left, right) = st.holdings.split_at_mut(j);
                let anchor = &mut left[i];
                let cand = &right[0];
                if !anchor.same_key(cand) {
                    break;
                }
                if assume_ordered && cand.start() > anchor.end() + anchor.tolerance() {
                    break;
                }
                if anchor.try_extend(cand.start(), cand.len_ms(), &self.store) {
                    self.discard(st, j);
                    merges += 1;
                    // 锚点变长后，之前跳过的候选可能也能合并
                    j = i + 1;
                    continue;
                }
                j += 1;
            }

            if last_log.elapsed() >= PROGRESS_EVERY {
                tracing::info!(
                    "[{}] consolidate: {} merges so far, {}/{} holdings scanned ({:?})",
                    tag,
                    merges,
                    i,
                    st.holdings.len(),
                    started.elapsed()
                );
                last_log = Instant::now();
            }
            i += 1;
        }

        IndexStats::add(&self.store.stats().merges, merges);
        self.size.store(st.holdings.len(), Ordering::Relaxed);
        if merges > 0 {
            tracing::debug!(
                "[{}] consolidate merged {} holdings in {:?}",
                tag,
                merges,
                started.elapsed()
            );
        }
        merges
    }

    /// 强制写回并移除 end 早于 `age_secs` 的区间；`age_secs <= 0` 移除全部。
    pub fn purge_old(&self, age_secs: i64) -> usize {
        let mut guard = self.state.write();
        let n = self.purge_locked(&mut guard, age_secs);
        self.size.store(guard.holdings.len(), Ordering::Relaxed);
        n
    }

    fn purge_locked(&self, st: &mut IndexState, age_secs: i64) -> usize {
        self.retry_orphans(st);
        let cutoff = now_ms() - age_secs.saturating_mul(1000);
        let mut purged = 0usize;
        let mut kept = 0usize;

        // 从尾到头：删除引起的平移不影响尚未访问的元素
        for idx in (0..st.holdings.len()).rev() {
            let h = &mut st.holdings[idx];
            let expired = age_secs <= 0 || h.end() < cutoff;
            if !expired && !h.is_out_of_scope() {
                continue;
            }
            match h.persist(&self.store) {
                PersistOutcome::Failed | PersistOutcome::Missing if age_secs > 0 => {
                    kept += 1;
                    continue;
                }
                _ => {}
            }
            st.remove(idx);
            purged += 1;
        }

        IndexStats::add(&self.store.stats().purged, purged);
        if purged > 0 || kept > 0 {
            tracing::info!(
                "[{}] purged {} holdings older than {}s ({} kept after failed write)",
                self.tag(),
                purged,
                age_secs,
                kept
            );
        }
        purged
    }

    /// 轮转写回：从游标处继续，最多写 `max_per_call` 个“脏且已老化”的区间。
    pub fn keep_writing(&self, min_age_secs: i64, max_per_call: usize) -> usize {
        let mut guard = self.state.write();
        let st = &mut *guard;
        self.retry_orphans(st);
        let len = st.holdings.len();
        if len == 0 || max_per_call == 0 {
            return 0;
        }
        if st.cursor >= len {
            tracing::debug!(
                "[{}] write cursor {} beyond {} holdings, resetting",
                self.tag(),
                st.cursor,
                len
            );
            st.cursor = 0;
        }

        let min_age_ms = min_age_secs.saturating_mul(1000);
        let mut written = 0usize;
        let mut visited = 0usize;
        let mut vanished = false;
        while visited < len && written < max_per_call {
            let idx = st.cursor;
            let h = &mut st.holdings[idx];
            if h.persist_if_aged(min_age_ms, &self.store) {
                written += 1;
            }
            vanished |= h.is_out_of_scope();
            st.cursor = (idx + 1) % len;
            visited += 1;
        }

        if written == 0 && visited == len {
            tracing::debug!("[{}] keep_writing: full lap, nothing eligible", self.tag());
        }

        if vanished {
            for idx in (0..st.holdings.len()).rev() {
                if st.holdings[idx].is_out_of_scope() {
                    st.remove(idx);
                }
            }
            self.size.store(st.holdings.len(), Ordering::Relaxed);
        }
        written
    }

    /// 某 channel（None = 任意）是否有单个区间完整覆盖 [time, time+duration]。
    ///
    /// 日界模式下按天分段，每段各由一个区间覆盖即可。
    pub fn contains_fully(&self, channel: Option<&str>, time: i64, duration_ms: i64) -> bool {
        let chan = match channel.map(Channel::parse).transpose() {
            Ok(c) => c,
            Err(_) => return false,
        };
        let end = match span_end(time, duration_ms.max(0)) {
            Ok(end) => end,
            Err(_) => return false,
        };
        let st = self.state.read();
        day_pieces(time, end, self.store.day_bound()).all(|(from, to)| {
            st.holdings
                .iter()
                .any(|h| chan.map_or(true, |c| h.channel() == c) && h.contains(from, to - from))
        })
    }

    /// 合并后尚未删掉的后备行数
    pub fn pending_deletes(&self) -> usize {
        self.state.read().orphans.len()
    }

    /// 所有列出的 channel 都完整覆盖该 span
    pub fn contains_fully_all(&self, channels: &[&str], time: i64, duration_ms: i64) -> bool {
        !channels.is_empty()
            && channels
                .iter()
                .all(|c| self.contains_fully(Some(*c), time, duration_ms))
    }

    /// 关机：全部写回并移除，之后拒绝插入
    pub fn close(&self) -> usize {
        let mut guard = self.state.write();
        let n = self.purge_locked(&mut guard, 0);
        guard.closed = true;
        self.size.store(guard.holdings.len(), Ordering::Relaxed);
        if !guard.orphans.is_empty() {
            tracing::warn!(
                "[{}] {} merged rows could not be deleted, consolidate will absorb them after reload",
                self.tag(),
                guard.orphans.len()
            );
        }
        tracing::info!("[{}] closed, {} holdings flushed", self.tag(), n);
        n
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 当前区间快照，可按 channel 通配过滤
    pub fn holdings(&self, filter: Option<&str>) -> Vec<Holding> {
        let matcher = filter.map(create_matcher);
        self.state
            .read()
            .holdings
            .iter()
            .filter(|h| matcher.as_ref().map_or(true, |m| m.matches(h.channel().as_str())))
            .cloned()
            .collect()
    }

    /// 诊断输出：每行一个区间
    pub fn dump(&self, filter: Option<&str>) -> String {
        let list = self.holdings(filter);
        let mut out = String::new();
        let _ = writeln!(out, "[{}] {} holdings", self.tag(), list.len());
        for h in &list {
            let _ = writeln!(out, "  {}", h);
        }
        out
    }

    /// 之后新建的区间及现有区间是否延迟写
    pub fn set_defer_update(&self, defer: bool) {
        let mut st = self.state.write();
        st.defer = defer;
        for h in st.holdings.iter_mut() {
            h.set_deferred(defer);
        }
    }

    pub fn set_tag(&self, tag: &str) {
        self.tag.store(Arc::new(tag.to_string()));
    }

    pub fn tag(&self) -> Arc<String> {
        self.tag.load_full()
    }

    /// 从存储重建 end >= `since_ms` 的区间（已在内存中的 id 跳过），返回载入数。
    pub fn load_from_store(&self, since_ms: i64) -> Result<usize> {
        let rows = self.store.gateway().select_since(since_ms)?;
        let mut guard = self.state.write();
        let st = &mut *guard;
        let known: HashSet<i64> = st
            .holdings
            .iter()
            .map(|h| h.id())
            .chain(st.orphans.iter().copied())
            .collect();

        let mut loaded = 0usize;
        for row in rows.iter().filter(|r| !known.contains(&r.id)) {
            match Holding::from_row(row) {
                Ok(mut h) => {
                    h.set_deferred(st.defer);
                    st.holdings.push(h);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("[{}] skipping stored row {}: {}", self.tag(), row.id, e);
                    self.store.alerts().raise(
                        AlertClass::Invariant,
                        &format!("stored row {} unreadable: {}", row.id, e),
                    );
                }
            }
        }
        st.holdings.sort();
        self.size.store(st.holdings.len(), Ordering::Relaxed);
        tracing::info!(
            "[{}] loaded {} holdings from {}",
            self.tag(),
            loaded,
            self.store.gateway().table()
        );
        Ok(loaded)
    }

    pub fn report(&self) -> StatsReport {
        self.store
            .stats()
            .report(&self.tag(), self.size(), self.store.alerts().suppressed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DayKey;
    use crate::storage::{Gateway, HoldingRow, MemoryGateway};

    // 2023-11-15T00:00:00Z
    const BASE: i64 = 1_700_006_400_000;
    const CHAN: &str = "USAAA  BHZ00";
    const OTHER: &str = "USBBB  BHZ00";
    const TOL: i64 = 55;

    fn index() -> (Arc<MemoryGateway>, HoldingIndex) {
        let gw = Arc::new(MemoryGateway::new("holdings"));
        let idx = HoldingIndex::new(HoldingStore::new(gw.clone()));
        (gw, idx)
    }

    fn row(channel: &str, start: i64, end: i64) -> HoldingRow {
        HoldingRow {
            id: 0,
            channel: channel.into(),
            kind: "AA".into(),
            start,
            end,
            day: DayKey::of(start).days(),
        }
    }

    fn bounds(idx: &HoldingIndex) -> Vec<(String, i64, i64)> {
        idx.holdings(None)
            .iter()
            .map(|h| (h.channel().to_string(), h.start() - BASE, h.end() - BASE))
            .collect()
    }

    fn assert_sorted(idx: &HoldingIndex) {
        let list = idx.holdings(None);
        for w in list.windows(2) {
            assert!(w[0] <= w[1], "out of order: {} / {}", w[0], w[1]);
        }
    }

    #[test]
    fn adjacent_spans_extend_one_holding() {
        let (gw, idx) = index();
        assert_eq!(idx.insert_span(CHAN, "AA", BASE + 15_000, 10_000).unwrap(), Placement::Created);
        assert_eq!(idx.insert_span(CHAN, "AA", BASE + 25_000, 10_000).unwrap(), Placement::Extended);

        assert_eq!(bounds(&idx), vec![(CHAN.to_string(), 15_000, 35_000)]);
        let rows = gw.rows("holdings");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].start, rows[0].end), (BASE + 15_000, BASE + 35_000));
    }

    #[test]
    fn gap_is_bridged() {
        let (gw, idx) = index();
        idx.insert_span(CHAN, "AA", BASE + 15_000, 10_000).unwrap();
        idx.insert_span(CHAN, "AA", BASE + 25_000, 10_000).unwrap();
        idx.insert_span(CHAN, "AA", BASE + 40_000, 10_000).unwrap();
        assert_eq!(idx.size(), 2);

        idx.insert_span(CHAN, "AA", BASE + 35_000, 5_000).unwrap();
        assert_eq!(bounds(&idx), vec![(CHAN.to_string(), 15_000, 50_000)]);

        let rows = gw.rows("holdings");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].start, rows[0].end), (BASE + 15_000, BASE + 50_000));
        assert_eq!(gw.counts().deletes, 1);
    }

    #[test]
    fn channels_stay_isolated() {
        let (_gw, idx) = index();
        for i in 0..5 {
            idx.insert_span(CHAN, "AA", BASE + i * 20_000, 10_000).unwrap();
            idx.insert_span(OTHER, "AA", BASE + i * 20_000, 10_000).unwrap();
        }
        for i in (0..5).rev() {
            idx.insert_span(OTHER, "AA", BASE + i * 20_000 + 10_000, 10_000).unwrap();
            idx.insert_span(CHAN, "AA", BASE + i * 20_000 + 10_000, 10_000).unwrap();
        }
        while idx.consolidate(0, true) > 0 {}

        assert_eq!(
            bounds(&idx),
            vec![
                (CHAN.to_string(), 0, 100_000),
                (OTHER.to_string(), 0, 100_000),
            ]
        );
    }

    #[test]
    fn identical_span_is_idempotent() {
        let (gw, idx) = index();
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        assert_eq!(idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap(), Placement::Extended);
        assert_eq!(bounds(&idx), vec![(CHAN.to_string(), 0, 10_000)]);
        assert_eq!(gw.counts().updates, 0);
        assert!(idx.contains_fully(Some(CHAN), BASE, 10_000));
    }

    #[test]
    fn tolerance_boundary() {
        let (_gw, idx) = index();
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        assert_eq!(
            idx.insert_span(CHAN, "AA", BASE + 10_000 + TOL, 1_000).unwrap(),
            Placement::Extended
        );
        assert_eq!(
            idx.insert_span(CHAN, "AA", BASE + 11_000 + 2 * TOL + 1, 1_000).unwrap(),
            Placement::Created
        );
        assert_eq!(idx.size(), 2);
    }

    #[test]
    fn day_boundary_starts_new_holding() {
        let (_gw, idx) = index();
        let midnight = BASE + crate::core::MS_PER_DAY;
        idx.insert_span(CHAN, "AA", midnight - 10_000, 10_000).unwrap();
        assert_eq!(idx.insert_span(CHAN, "AA", midnight, 10_000).unwrap(), Placement::Created);
        assert_eq!(idx.size(), 2);
        assert_eq!(idx.consolidate(0, true), 0);
        assert_eq!(idx.report().day_rejects, 2);
    }

    #[test]
    fn span_across_midnight_is_split_per_day() {
        let (gw, idx) = index();
        let day = crate::core::MS_PER_DAY;
        let midnight = BASE + day;

        assert_eq!(
            idx.insert_span(CHAN, "AA", midnight - 10_000, 15_000).unwrap(),
            Placement::Created
        );
        assert_eq!(
            bounds(&idx),
            vec![
                (CHAN.to_string(), day - 10_000, day),
                (CHAN.to_string(), day, day + 5_000),
            ]
        );
        assert!(idx.contains_fully(Some(CHAN), midnight - 10_000, 15_000));

        // 重传的包落在已有覆盖内
        assert_eq!(idx.insert_span(CHAN, "AA", midnight, 5_000).unwrap(), Placement::Extended);
        assert_eq!(
            idx.insert_span(CHAN, "AA", midnight + 3_000, 5_000).unwrap(),
            Placement::Extended
        );
        while idx.consolidate(0, false) > 0 {}

        let list = idx.holdings(None);
        assert_eq!(list.len(), 2);
        assert!(list[1].start() >= list[0].end(), "overlap: {} / {}", list[0], list[1]);
        assert_ne!(list[0].day(), list[1].day());
        assert_eq!((list[1].start(), list[1].end()), (midnight, midnight + 8_000));
        assert_eq!(gw.rows("holdings").len(), 2);
    }

    #[test]
    fn failed_merge_delete_is_retried() {
        let (gw, idx) = index();
        gw.seed(row(CHAN, BASE, BASE + 10_000));
        let absorbed = gw.seed(row(CHAN, BASE + 5_000, BASE + 20_000));
        idx.load_from_store(BASE).unwrap();
        idx.set_defer_update(true);

        gw.fail_next(2);
        assert_eq!(idx.consolidate(0, true), 1);
        assert_eq!(idx.size(), 1);
        assert_eq!(idx.pending_deletes(), 1);
        assert!(gw.exists_by_id(absorbed).unwrap());

        // 未删掉的行不会被重新装载成重复区间
        assert_eq!(idx.load_from_store(BASE).unwrap(), 0);

        idx.keep_writing(0, 10);
        assert_eq!(idx.pending_deletes(), 0);
        let rows = gw.rows("holdings");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].start, rows[0].end), (BASE, BASE + 20_000));
    }

    #[test]
    fn failed_bridge_delete_is_retried_on_purge() {
        let (gw, idx) = index();
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        idx.insert_span(CHAN, "AA", BASE + 20_000, 10_000).unwrap();

        // 延迟写下桥接只有 delete 一次网关调用，两次尝试都失败
        idx.set_defer_update(true);
        gw.fail_next(2);
        assert_eq!(
            idx.insert_span(CHAN, "AA", BASE + 10_000, 10_000).unwrap(),
            Placement::Extended
        );
        assert_eq!(idx.size(), 1);
        assert_eq!(gw.rows("holdings").len(), 2);
        assert_eq!(idx.pending_deletes(), 1);

        assert_eq!(idx.purge_old(0), 1);
        assert_eq!(idx.pending_deletes(), 0);
        let rows = gw.rows("holdings");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].start, rows[0].end), (BASE, BASE + 30_000));
    }

    #[test]
    fn random_inserts_keep_order_and_coverage() {
        let (_gw, idx) = index();
        let chans = [CHAN, OTHER, "XXCCC  HHZ  "];
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut spans = Vec::new();
        for _ in 0..300 {
            let c = chans[(next() % 3) as usize];
            let t = BASE + (next() % 3_600_000) as i64;
            let d = (next() % 5_000) as i64;
            idx.insert_span(c, "AA", t, d).unwrap();
            spans.push((c, t, d));
            assert_sorted(&idx);
        }
        for (c, t, d) in &spans {
            assert!(idx.contains_fully(Some(*c), *t, *d));
        }

        while idx.consolidate(0, true) > 0 {}
        assert_sorted(&idx);
        let list = idx.holdings(None);
        for w in list.windows(2) {
            assert!(w[0].start() <= w[0].end());
            if w[0].same_key(&w[1]) {
                assert!(w[1].start() > w[0].end() + w[0].tolerance());
            }
        }
        for (c, t, d) in &spans {
            assert!(idx.contains_fully(Some(*c), *t, *d));
        }
    }

    #[test]
    fn consolidate_merges_stored_overlaps() {
        let (gw, idx) = index();
        gw.seed(row(CHAN, BASE, BASE + 10_000));
        gw.seed(row(CHAN, BASE + 5_000, BASE + 20_000));
        gw.seed(row(CHAN, BASE + 20_000 + TOL, BASE + 30_000));
        gw.seed(row(OTHER, BASE, BASE + 1_000));

        assert_eq!(idx.load_from_store(BASE).unwrap(), 4);
        assert_eq!(idx.load_from_store(BASE).unwrap(), 0);
        assert_sorted(&idx);

        assert_eq!(idx.consolidate(0, true), 2);
        assert_eq!(
            bounds(&idx),
            vec![(CHAN.to_string(), 0, 30_000), (OTHER.to_string(), 0, 1_000)]
        );
        let rows = gw.rows("holdings");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.start == BASE && r.end == BASE + 30_000));
    }

    #[test]
    fn consolidate_respects_merge_cap() {
        let (gw, idx) = index();
        for i in 0..6 {
            gw.seed(row(CHAN, BASE + i * 1_000, BASE + i * 1_000 + 5_000));
        }
        idx.load_from_store(0).unwrap();

        assert_eq!(idx.consolidate(2, true), 2);
        assert_eq!(idx.size(), 4);
        let mut total = 2;
        loop {
            let n = idx.consolidate(2, false);
            assert!(n <= 2);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 5);
        assert_eq!(bounds(&idx), vec![(CHAN.to_string(), 0, 10_000)]);
    }

    #[test]
    fn load_skips_unreadable_rows() {
        let (gw, idx) = index();
        gw.seed(row(CHAN, BASE, BASE + 10));
        gw.seed(row("bad!", BASE, BASE + 10));
        gw.seed(row(CHAN, BASE + 50, BASE));
        assert_eq!(idx.load_from_store(0).unwrap(), 1);
        assert_eq!(idx.size(), 1);
    }

    #[test]
    fn purge_removes_only_aged() {
        let (_gw, idx) = index();
        let recent = now_ms() - 10_000;
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        idx.insert_span(OTHER, "AA", recent, 1_000).unwrap();

        assert_eq!(idx.purge_old(3600), 1);
        assert_eq!(idx.size(), 1);
        assert_eq!(idx.holdings(None)[0].channel().as_str(), OTHER);
    }

    #[test]
    fn purge_zero_flushes_everything() {
        let (gw, idx) = index();
        idx.set_defer_update(true);
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        idx.insert_span(CHAN, "AA", BASE + 10_000, 10_000).unwrap();
        idx.insert_span(OTHER, "AA", BASE, 10_000).unwrap();
        assert!(gw.rows("holdings").is_empty());

        assert_eq!(idx.purge_old(0), 2);
        assert!(idx.is_empty());
        let rows = gw.rows("holdings");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.end == BASE + 20_000));
    }

    #[test]
    fn purge_keeps_holding_whose_write_failed() {
        let (gw, idx) = index();
        idx.set_defer_update(true);
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();

        gw.fail_next(2);
        assert_eq!(idx.purge_old(60), 0);
        assert_eq!(idx.size(), 1);

        assert_eq!(idx.purge_old(60), 1);
        assert_eq!(gw.rows("holdings").len(), 1);
    }

    #[test]
    fn keep_writing_is_bounded_per_call() {
        let (gw, idx) = index();
        idx.set_defer_update(true);
        for i in 0..10 {
            idx.insert_span(CHAN, "AA", BASE + i * 60_000, 10_000).unwrap();
        }
        assert_eq!(idx.size(), 10);

        let mut calls = Vec::new();
        loop {
            let n = idx.keep_writing(0, 3);
            assert!(n <= 3);
            if n == 0 {
                break;
            }
            calls.push(n);
        }
        assert_eq!(calls, vec![3, 3, 3, 1]);
        assert_eq!(gw.rows("holdings").len(), 10);
        assert!(idx.holdings(None).iter().all(|h| !h.is_dirty()));
    }

    #[test]
    fn keep_writing_cursor_recovers_after_tail_purge() {
        let (gw, idx) = index();
        idx.set_defer_update(true);
        let late = BASE + 3_600_000;
        for i in 0..4 {
            idx.insert_span(CHAN, "AA", late + i * 60_000, 10_000).unwrap();
        }
        for i in 0..6 {
            idx.insert_span(OTHER, "AA", BASE + i * 60_000, 10_000).unwrap();
        }
        assert_eq!(idx.keep_writing(0, 8), 8);
        assert_eq!(idx.state.read().cursor, 8);

        // 尾部 OTHER 全部过期：游标跟着左移，落到 len 上
        let age_secs = (now_ms() - (BASE + 1_800_000)) / 1000;
        assert_eq!(idx.purge_old(age_secs), 6);
        assert_eq!(idx.size(), 4);
        assert_eq!(idx.state.read().cursor, 4);

        for i in 0..4 {
            idx.insert_span(CHAN, "AA", late + i * 60_000 + 10_000, 1_000).unwrap();
        }
        assert_eq!(idx.keep_writing(0, 3), 3);
        assert_eq!(idx.state.read().cursor, 3);
        assert_eq!(idx.keep_writing(0, 3), 1);
        assert!(idx.holdings(None).iter().all(|h| !h.is_dirty()));

        let ends: Vec<i64> = gw
            .rows("holdings")
            .iter()
            .filter(|r| r.channel == CHAN)
            .map(|r| r.end - r.start)
            .collect();
        assert_eq!(ends, vec![11_000; 4]);
    }

    #[test]
    fn keep_writing_waits_for_age() {
        let (gw, idx) = index();
        idx.set_defer_update(true);
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        assert_eq!(idx.keep_writing(3600, 10), 0);
        assert!(gw.rows("holdings").is_empty());
        assert_eq!(idx.keep_writing(0, 10), 1);
    }

    #[test]
    fn keep_writing_drops_vanished_holdings() {
        let (gw, idx) = index();
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        let id = idx.holdings(None)[0].id();
        idx.set_defer_update(true);
        assert!(gw.forget(id));

        idx.insert_span(CHAN, "AA", BASE + 10_000, 1_000).unwrap();
        assert_eq!(idx.keep_writing(0, 10), 0);
        assert!(idx.is_empty());
        assert_eq!(idx.report().vanished, 1);
    }

    #[test]
    fn close_flushes_and_rejects_inserts() {
        let (gw, idx) = index();
        idx.set_defer_update(true);
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        assert_eq!(idx.close(), 1);
        assert!(idx.is_closed());
        assert_eq!(gw.rows("holdings").len(), 1);
        assert!(matches!(
            idx.insert_span(CHAN, "AA", BASE, 1),
            Err(HoldingError::Closed)
        ));
    }

    #[test]
    fn validation_errors_surface() {
        let (_gw, idx) = index();
        assert!(matches!(
            idx.insert_span("nope", "AA", BASE, 1),
            Err(HoldingError::InvalidChannel(_))
        ));
        assert!(matches!(
            idx.insert_span(CHAN, "AA", -1, 1),
            Err(HoldingError::TimeOutOfRange { .. })
        ));
        assert!(idx.is_empty());
    }

    #[test]
    fn contains_fully_variants() {
        let (_gw, idx) = index();
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        idx.insert_span(OTHER, "AA", BASE + 5_000, 10_000).unwrap();

        assert!(idx.contains_fully(None, BASE + 12_000, 1_000));
        assert!(!idx.contains_fully(Some(CHAN), BASE + 12_000, 1_000));
        assert!(!idx.contains_fully(Some("garbage"), BASE, 1));
        assert!(idx.contains_fully_all(&[CHAN, OTHER], BASE + 5_000, 5_000));
        assert!(!idx.contains_fully_all(&[CHAN, OTHER], BASE, 5_000));
        assert!(!idx.contains_fully_all(&[], BASE, 1));
    }

    #[test]
    fn dump_filters_and_tags() {
        let (_gw, idx) = index();
        idx.set_tag("live");
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        idx.insert_span(OTHER, "AA", BASE, 10_000).unwrap();

        let text = idx.dump(Some("USA*"));
        assert!(text.starts_with("[live] 1 holdings"));
        assert!(text.contains("USAAA"));
        assert!(!text.contains("USBBB"));
        assert_eq!(idx.report().tag, "live");
        assert_eq!(idx.report().creates, 2);
    }

    #[test]
    fn stored_holding_roundtrips_by_id() {
        let (_gw, idx) = index();
        idx.insert_span(CHAN, "AA", BASE, 10_000).unwrap();
        idx.insert_span(CHAN, "AA", BASE + 10_000, 2_000).unwrap();
        let h = &idx.holdings(None)[0];
        let back = Holding::load_by_id(h.id(), idx.store()).unwrap().unwrap();
        assert_eq!((back.start(), back.end()), (h.start(), h.end()));
        assert_eq!(back.channel(), h.channel());
        assert!(idx.store().gateway().exists_by_id(h.id()).unwrap());
    }
}
