use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::storage::gateway::{validate_table_name, Gateway, GatewayError, HoldingRow};
use crate::storage::retry::RetryPolicy;

/// 写入计数快照（测试断言用）
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub archived: u64,
    pub failures: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    archived: AtomicU64,
    failures: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    tables: HashMap<String, BTreeMap<i64, HoldingRow>>,
}

/// 进程内网关：多张表共享一个 id 序列，语义对齐 `SqliteGateway`。
///
/// 支持故障注入（`fail_next`），用于覆盖“失败 → 重连 → 重试”路径；
/// 重连本身只计数，不丢数据。
pub struct MemoryGateway {
    table: String,
    inner: Mutex<Tables>,
    retry: RetryPolicy,
    fail_next: AtomicU32,
    counters: Counters,
}

impl MemoryGateway {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            inner: Mutex::new(Tables {
                next_id: 1,
                tables: HashMap::new(),
            }),
            retry: RetryPolicy::immediate(2),
            fail_next: AtomicU32::new(0),
            counters: Counters::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 让接下来的 n 次操作以瞬时错误失败
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn counts(&self) -> WriteCounts {
        let c = &self.counters;
        WriteCounts {
            inserts: c.inserts.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            archived: c.archived.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    /// 某表全部行（按 id 升序）
    pub fn rows(&self, table: &str) -> Vec<HoldingRow> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 绕过计数直接写入一行（模拟历史数据 / 外部写入），返回 id
    pub fn seed(&self, mut row: HoldingRow) -> i64 {
        let mut g = self.inner.lock();
        let id = g.next_id;
        g.next_id += 1;
        row.id = id;
        g.tables.entry(self.table.clone()).or_default().insert(id, row);
        id
    }

    /// 模拟外部清理：直接删掉一行
    pub fn forget(&self, id: i64) -> bool {
        self.inner
            .lock()
            .tables
            .get_mut(&self.table)
            .and_then(|t| t.remove(&id))
            .is_some()
    }

    fn with_tables<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&mut Tables) -> T,
    ) -> Result<T, GatewayError> {
        let mut g = self.inner.lock();
        let r = self.retry.run(
            what,
            &mut *g,
            |_| {
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            |t| {
                let injected = self
                    .fail_next
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if injected {
                    return Err(GatewayError::Backend(format!("{what}: injected failure")));
                }
                Ok(op(t))
            },
        );
        if r.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        r
    }

    fn update_with(
        &self,
        what: &str,
        id: i64,
        f: impl Fn(&mut HoldingRow),
    ) -> Result<usize, GatewayError> {
        let n = self.with_tables(what, |t| {
            match t.tables.get_mut(&self.table).and_then(|rows| rows.get_mut(&id)) {
                Some(row) => {
                    f(row);
                    1
                }
                None => 0,
            }
        })?;
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }
}

impl Gateway for MemoryGateway {
    fn table(&self) -> &str {
        &self.table
    }

    fn insert(&self, row: &HoldingRow) -> Result<i64, GatewayError> {
        let id = self.with_tables("insert", |t| {
            let id = t.next_id;
            t.next_id += 1;
            let mut stored = row.clone();
            stored.id = id;
            t.tables.entry(self.table.clone()).or_default().insert(id, stored);
            id
        })?;
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn update_start(&self, id: i64, start: i64) -> Result<usize, GatewayError> {
        self.update_with("update_start", id, |r| r.start = start)
    }

    fn update_end(&self, id: i64, end: i64) -> Result<usize, GatewayError> {
        self.update_with("update_end", id, |r| r.end = end)
    }

    fn update_both(&self, id: i64, start: i64, end: i64) -> Result<usize, GatewayError> {
        self.update_with("update_both", id, |r| {
            r.start = start;
            r.end = end;
        })
    }

    fn delete(&self, id: i64) -> Result<usize, GatewayError> {
        let n = self.with_tables("delete", |t| {
            t.tables
                .get_mut(&self.table)
                .and_then(|rows| rows.remove(&id))
                .map_or(0, |_| 1)
        })?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    fn select_by_id(&self, id: i64) -> Result<Option<HoldingRow>, GatewayError> {
        self.with_tables("select_by_id", |t| {
            t.tables.get(&self.table).and_then(|rows| rows.get(&id)).cloned()
        })
    }

    fn select_since(&self, since_ms: i64) -> Result<Vec<HoldingRow>, GatewayError> {
        self.with_tables("select_since", |t| {
            t.tables
                .get(&self.table)
                .map(|rows| rows.values().filter(|r| r.end >= since_ms).cloned().collect())
                .unwrap_or_default()
        })
    }

    fn copy_then_delete(&self, dest_table: &str, ids: &[i64]) -> Result<usize, GatewayError> {
        validate_table_name(dest_table)?;
        let moved = self.with_tables("copy_then_delete", |t| {
            let mut moved = Vec::new();
            if let Some(src) = t.tables.get_mut(&self.table) {
                for id in ids {
                    if let Some(row) = src.remove(id) {
                        moved.push(row);
                    }
                }
            }
            let n = moved.len();
            let dest = t.tables.entry(dest_table.to_string()).or_default();
            for row in moved {
                dest.insert(row.id, row);
            }
            n
        })?;
        self.counters
            .archived
            .fetch_add(moved as u64, Ordering::Relaxed);
        Ok(moved)
    }
}
