use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    fmt_ms, now_ms, validate_time, AlertClass, AlertLimiter, Channel, DayKey, HoldingError,
    Result, SourceType,
};
use crate::stats::IndexStats;
use crate::storage::{Gateway, HoldingRow};

/// 行丢失时，end 早于该宽限期才视为“已被外部清理”（预期内）
pub const DEFAULT_VANISH_GRACE: Duration = Duration::from_secs(72 * 3600);

/// Holding 的持久化上下文：网关 + 告警 + 计数 + 写入策略。
///
/// 由索引持有，按引用传给每个 Holding；Holding 自身不持有网关。
pub struct HoldingStore {
    gateway: Arc<dyn Gateway>,
    alerts: Arc<AlertLimiter>,
    stats: Arc<IndexStats>,
    auto_write: bool,
    day_bound: bool,
    vanish_grace_ms: i64,
}

impl HoldingStore {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            alerts: Arc::new(AlertLimiter::default()),
            stats: Arc::new(IndexStats::default()),
            auto_write: true,
            day_bound: true,
            vanish_grace_ms: DEFAULT_VANISH_GRACE.as_millis() as i64,
        }
    }

    /// false = “不自动写”模式：新建与变更都只置脏，由调度器或显式 persist 落库
    pub fn with_auto_write(mut self, on: bool) -> Self {
        self.auto_write = on;
        self
    }

    /// true = 区间不得跨日扩展（day-key 分区）
    pub fn with_day_bound(mut self, on: bool) -> Self {
        self.day_bound = on;
        self
    }

    pub fn with_vanish_grace(mut self, grace: Duration) -> Self {
        self.vanish_grace_ms = grace.as_millis() as i64;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertLimiter>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_stats(mut self, stats: Arc<IndexStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn gateway(&self) -> &dyn Gateway {
        self.gateway.as_ref()
    }

    pub fn alerts(&self) -> &AlertLimiter {
        &self.alerts
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    pub fn auto_write(&self) -> bool {
        self.auto_write
    }

    pub fn day_bound(&self) -> bool {
        self.day_bound
    }
}

/// 一次写回的结果
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    /// 不脏，无需写
    Clean,
    /// 已写入（insert 或 update）
    Written,
    /// 行已不存在且足够老：标记 out-of-scope，等待索引移除
    OutOfScope,
    /// 行不存在但还不够老：已告警，保持脏等待重试
    Missing,
    /// 网关错误（重试后仍失败）：已告警，保持脏等待重试
    Failed,
}

/// 覆盖区间（holding）：某 (channel, type) 一段连续已收数据。
///
/// 身份（id/channel/type）创建后固定；边界只由索引（extend）和调度器（persist）修改。
/// 顺序按 (channel, type, start)，必须与索引数组一致，二分查找依赖于此。
#[derive(Clone, Debug)]
pub struct Holding {
    id: i64,
    channel: Channel,
    kind: SourceType,
    start: i64,
    end: i64,
    tolerance: i64,
    day: DayKey,
    dirty: bool,
    start_moved: bool,
    end_moved: bool,
    deferred: bool,
    modified_at: i64,
    written_at: i64,
    out_of_scope: bool,
}

impl Holding {
    /// 新建：校验后同步 insert（延迟写或“不自动写”模式下只置脏）。
    ///
    /// 插入失败不会丢掉该区间：告警后保持脏（id=0），由调度器补写。
    pub fn new(
        channel: &str,
        kind: &str,
        time: i64,
        duration_ms: i64,
        deferred: bool,
        store: &HoldingStore,
    ) -> Result<Self> {
        Self::create(
            Channel::parse(channel)?,
            SourceType::parse(kind)?,
            time,
            duration_ms,
            deferred,
            store,
        )
    }

    pub(crate) fn create(
        channel: Channel,
        kind: SourceType,
        time: i64,
        duration_ms: i64,
        deferred: bool,
        store: &HoldingStore,
    ) -> Result<Self> {
        let end = span_end(time, duration_ms)?;
        if store.day_bound && end > DayKey::of(time).end_ms() {
            return Err(HoldingError::CrossesDay { start: time, end });
        }
        let mut h = Self::scratch();
        h.reload(channel, kind, time, end);
        h.deferred = deferred;
        h.dirty = true;
        h.modified_at = now_ms();
        if !deferred && store.auto_write {
            h.persist(store);
        }
        Ok(h)
    }

    /// 按 id 点查重建
    pub fn load_by_id(id: i64, store: &HoldingStore) -> Result<Option<Self>> {
        match store.gateway.select_by_id(id)? {
            Some(row) => Ok(Some(Self::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// 由查询行重建（干净状态）
    pub fn from_row(row: &HoldingRow) -> Result<Self> {
        let channel = Channel::parse(&row.channel)?;
        let kind = SourceType::parse(&row.kind)?;
        validate_time(row.start)?;
        validate_time(row.end)?;
        if row.end < row.start {
            return Err(HoldingError::InvertedSpan {
                start: row.start,
                end: row.end,
            });
        }
        let now = now_ms();
        Ok(Self {
            id: row.id,
            channel,
            kind,
            start: row.start,
            end: row.end,
            tolerance: channel.tolerance_ms(),
            day: DayKey::from_days(row.day),
            dirty: false,
            start_moved: false,
            end_moved: false,
            deferred: false,
            modified_at: now,
            written_at: now,
            out_of_scope: false,
        })
    }

    /// 空白占位：只用于原地 reload，不代表任何真实区间
    pub(crate) fn scratch() -> Self {
        Self {
            id: 0,
            channel: Channel::blank(),
            kind: SourceType::blank(),
            start: 0,
            end: 0,
            tolerance: 0,
            day: DayKey::from_days(0),
            dirty: false,
            start_moved: false,
            end_moved: false,
            deferred: false,
            modified_at: 0,
            written_at: 0,
            out_of_scope: false,
        }
    }

    /// 原地重置为候选值（二分查找时复用，避免分配）
    pub fn reload(&mut self, channel: Channel, kind: SourceType, start: i64, end: i64) {
        self.id = 0;
        self.channel = channel;
        self.kind = kind;
        self.start = start;
        self.end = end.max(start);
        self.tolerance = channel.tolerance_ms();
        self.day = DayKey::of(start);
        self.dirty = false;
        self.start_moved = false;
        self.end_moved = false;
        self.deferred = false;
        self.out_of_scope = false;
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn kind(&self) -> SourceType {
        self.kind
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn len_ms(&self) -> i64 {
        self.end - self.start
    }

    pub fn tolerance(&self) -> i64 {
        self.tolerance
    }

    pub fn day(&self) -> DayKey {
        self.day
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn is_out_of_scope(&self) -> bool {
        self.out_of_scope
    }

    pub fn modified_at(&self) -> i64 {
        self.modified_at
    }

    pub fn written_at(&self) -> i64 {
        self.written_at
    }

    pub fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }

    pub fn same_key(&self, other: &Holding) -> bool {
        self.channel == other.channel && self.kind == other.kind
    }

    pub fn key_cmp(&self, other: &Holding) -> Ordering {
        (self.channel, self.kind, self.start).cmp(&(other.channel, other.kind, other.start))
    }

    /// [time, time+duration] 完全落在本区间内
    pub fn contains(&self, time: i64, duration_ms: i64) -> bool {
        time >= self.start && time.saturating_add(duration_ms.max(0)) <= self.end
    }

    /// 尝试用新观测到的 [time, time+duration] 扩展本区间，返回是否接受。
    ///
    /// 判定顺序：
    /// 1) 超出容差的不相交：拒绝
    /// 2) 日界模式下起点不在本区间的日，或终点越过次日零点：拒绝（起止两侧同一策略）
    /// 3) 完全包含：接受，不改动
    /// 4)~7) 相邻（容差内）或部分重叠：移动对应边界
    ///
    /// 边界变化后非延迟模式同步写回；延迟模式只置脏、刷新修改时间。
    pub fn extend(&mut self, time: i64, duration_ms: i64, store: &HoldingStore) -> Result<bool> {
        span_end(time, duration_ms)?;
        Ok(self.try_extend(time, duration_ms, store))
    }

    /// `extend` 去掉校验：调用方保证 span 已校验过
    pub(crate) fn try_extend(&mut self, time: i64, duration_ms: i64, store: &HoldingStore) -> bool {
        let new_start = time;
        let new_end = time.saturating_add(duration_ms.max(0));

        if new_start > self.end + self.tolerance || new_end < self.start - self.tolerance {
            return false;
        }

        if store.day_bound && (DayKey::of(new_start) != self.day || new_end > self.day.end_ms()) {
            IndexStats::bump(&store.stats.day_rejects);
            tracing::debug!(
                "{}: span {} crosses day {}, refused",
                self,
                fmt_ms(new_start),
                self.day
            );
            return false;
        }

        if new_start >= self.start && new_end <= self.end {
            return true;
        }

        // 起点侧：新 span 的尾部贴近 / 压住本区间起点
        if new_start < self.start {
            self.start = new_start;
            self.start_moved = true;
        }
        // 终点侧：新 span 的头部贴近 / 压住本区间终点
        if new_end > self.end {
            self.end = new_end;
            self.end_moved = true;
        }

        self.dirty = true;
        self.modified_at = now_ms();
        if !self.deferred && store.auto_write {
            self.persist(store);
        }
        true
    }

    /// 脏则写回：只写移动过的边界；从未落库（id=0）则 insert。
    pub fn persist(&mut self, store: &HoldingStore) -> PersistOutcome {
        if !self.dirty || self.out_of_scope {
            return PersistOutcome::Clean;
        }
        if self.id == 0 {
            return self.insert_row(store);
        }

        let gw = store.gateway();
        let res = match (self.start_moved, self.end_moved) {
            (true, false) => gw.update_start(self.id, self.start),
            (false, true) => gw.update_end(self.id, self.end),
            _ => gw.update_both(self.id, self.start, self.end),
        };

        match res {
            Ok(0) => self.on_row_missing(store),
            Ok(_) => {
                IndexStats::bump(&store.stats.writes);
                self.mark_clean();
                PersistOutcome::Written
            }
            Err(e) => {
                IndexStats::bump(&store.stats.write_failures);
                store
                    .alerts
                    .raise(AlertClass::PersistFailed, &format!("update {} failed: {}", self, e));
                PersistOutcome::Failed
            }
        }
    }

    /// 调度器入口：脏且距上次修改至少 `min_age_ms` 才写。返回是否真正写入。
    pub fn persist_if_aged(&mut self, min_age_ms: i64, store: &HoldingStore) -> bool {
        if !self.dirty || now_ms() - self.modified_at < min_age_ms {
            return false;
        }
        self.persist(store) == PersistOutcome::Written
    }

    /// 删除后备行（被 consolidate 吸收时）。失败只告警，不上抛。
    pub fn delete(&mut self, store: &HoldingStore) -> bool {
        if self.id == 0 {
            self.dirty = false;
            return true;
        }
        match store.gateway.delete(self.id) {
            Ok(_) => {
                IndexStats::bump(&store.stats.deletes);
                self.id = 0;
                self.dirty = false;
                true
            }
            Err(e) => {
                IndexStats::bump(&store.stats.write_failures);
                store
                    .alerts
                    .raise(AlertClass::PersistFailed, &format!("delete {} failed: {}", self, e));
                false
            }
        }
    }

    pub fn to_row(&self) -> HoldingRow {
        HoldingRow {
            id: self.id,
            channel: self.channel.to_string(),
            kind: self.kind.to_string(),
            start: self.start,
            end: self.end,
            day: self.day.days(),
        }
    }

    fn insert_row(&mut self, store: &HoldingStore) -> PersistOutcome {
        match store.gateway.insert(&self.to_row()) {
            Ok(id) => {
                self.id = id;
                IndexStats::bump(&store.stats.inserts);
                self.mark_clean();
                PersistOutcome::Written
            }
            Err(e) => {
                IndexStats::bump(&store.stats.write_failures);
                store
                    .alerts
                    .raise(AlertClass::PersistFailed, &format!("insert {} failed: {}", self, e));
                PersistOutcome::Failed
            }
        }
    }

    fn on_row_missing(&mut self, store: &HoldingStore) -> PersistOutcome {
        if now_ms() - self.end > store.vanish_grace_ms {
            // 老数据被其他进程清理属正常
            IndexStats::bump(&store.stats.vanished);
            tracing::debug!("{}: backing row gone, marking out of scope", self);
            self.out_of_scope = true;
            self.dirty = false;
            PersistOutcome::OutOfScope
        } else {
            store.alerts.raise(
                AlertClass::RowMissing,
                &format!("{}: backing row missing in {}", self, store.gateway.table()),
            );
            PersistOutcome::Missing
        }
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
        self.start_moved = false;
        self.end_moved = false;
        self.written_at = now_ms();
    }
}

/// 校验 span 并返回其终点
pub(crate) fn span_end(time: i64, duration_ms: i64) -> Result<i64> {
    validate_time(time)?;
    if duration_ms < 0 {
        return Err(HoldingError::NegativeDuration(duration_ms));
    }
    let end = time.saturating_add(duration_ms);
    validate_time(end)?;
    Ok(end)
}

/// 日界模式下把 [start, end] 在 UTC 零点处切成逐日片段；否则原样一段
pub(crate) fn day_pieces(start: i64, end: i64, day_bound: bool) -> impl Iterator<Item = (i64, i64)> {
    let mut next = Some(start);
    std::iter::from_fn(move || {
        let from = next?;
        let cut = if day_bound { DayKey::of(from).end_ms() } else { i64::MAX };
        if end <= cut {
            next = None;
            Some((from, end))
        } else {
            next = Some(cut);
            Some((from, cut))
        }
    })
}

impl PartialEq for Holding {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl Eq for Holding {}

impl PartialOrd for Holding {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Holding {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_cmp(other)
    }
}

impl fmt::Display for Holding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} id={} {} - {} ({}ms)",
            self.channel,
            self.kind,
            self.id,
            fmt_ms(self.start),
            fmt_ms(self.end),
            self.len_ms()
        )?;
        if self.dirty {
            f.write_str(" dirty")?;
        }
        if self.deferred {
            f.write_str(" deferred")?;
        }
        if self.out_of_scope {
            f.write_str(" out-of-scope")?;
        }
        Ok(())
    }
}
