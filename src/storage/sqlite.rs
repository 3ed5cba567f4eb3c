use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::storage::gateway::{validate_table_name, Gateway, GatewayError, HoldingRow};
use crate::storage::retry::RetryPolicy;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const STATEMENT_CACHE: usize = 32;
/// copy_then_delete 单个事务内的最大行数
const ARCHIVE_BATCH: usize = 500;

/// 预先拼好的 SQL（表名在构造时校验过）
struct Sql {
    insert: String,
    update_start: String,
    update_end: String,
    update_both: String,
    delete: String,
    select_by_id: String,
    exists: String,
    select_since: String,
}

impl Sql {
    fn for_table(t: &str) -> Self {
        Self {
            insert: format!(
                "INSERT INTO {t} (channel, type, start_ms, end_ms, day, updated_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            update_start: format!("UPDATE {t} SET start_ms = ?2, updated_ms = ?3 WHERE id = ?1"),
            update_end: format!("UPDATE {t} SET end_ms = ?2, updated_ms = ?3 WHERE id = ?1"),
            update_both: format!(
                "UPDATE {t} SET start_ms = ?2, end_ms = ?3, updated_ms = ?4 WHERE id = ?1"
            ),
            delete: format!("DELETE FROM {t} WHERE id = ?1"),
            select_by_id: format!(
                "SELECT id, channel, type, start_ms, end_ms, day FROM {t} WHERE id = ?1"
            ),
            exists: format!("SELECT 1 FROM {t} WHERE id = ?1"),
            select_since: format!(
                "SELECT id, channel, type, start_ms, end_ms, day FROM {t} WHERE end_ms >= ?1 ORDER BY channel, type, start_ms"
            ),
        }
    }
}

fn schema_sql(t: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {t} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            type TEXT NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            day INTEGER NOT NULL,
            updated_ms INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS {t}_chan_day ON {t} (channel, type, day);"
    )
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HoldingRow> {
    Ok(HoldingRow {
        id: row.get(0)?,
        channel: row.get(1)?,
        kind: row.get(2)?,
        start: row.get(3)?,
        end: row.get(4)?,
        day: row.get(5)?,
    })
}

fn now_ms() -> i64 {
    crate::core::now_ms()
}

/// SQLite 网关。
///
/// - 连接与其缓存的 prepared statements 不可并发使用：整个网关一把锁。
/// - 瞬时错误：丢弃连接（连带语句缓存失效）→ 重新打开 → 按 `RetryPolicy` 重试。
/// - `close()` 之后的调用返回 `GatewayError::Closed`，不再重连。
pub struct SqliteGateway {
    path: PathBuf,
    table: String,
    sql: Sql,
    conn: Mutex<Option<Connection>>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl SqliteGateway {
    pub fn open(path: impl Into<PathBuf>, table: &str, retry: RetryPolicy) -> Result<Self, GatewayError> {
        validate_table_name(table)?;
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GatewayError::Backend(format!("create {:?}: {}", parent, e)))?;
            }
        }
        let conn = Self::connect(&path)?;
        conn.execute_batch(&schema_sql(table))?;
        tracing::info!("SQLite gateway opened: {:?} table={}", path, table);
        Ok(Self {
            sql: Sql::for_table(table),
            path,
            table: table.to_string(),
            conn: Mutex::new(Some(conn)),
            retry,
            closed: AtomicBool::new(false),
        })
    }

    fn connect(path: &Path) -> Result<Connection, GatewayError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE);
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 确保某张表存在（归档表在首次搬迁前调用）
    pub fn ensure_table(&self, table: &str) -> Result<(), GatewayError> {
        validate_table_name(table)?;
        let ddl = schema_sql(table);
        self.with_conn("ensure_table", |c| c.execute_batch(&ddl))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("SQLite close failed: {}", e);
            }
        }
    }

    /// 主动丢弃当前连接，下一次调用走重连路径（运维 / 测试用）
    pub fn drop_connection(&self) {
        self.conn.lock().take();
    }

    fn with_conn<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Closed);
        }
        let mut slot = self.conn.lock();
        let path = &self.path;
        self.retry.run(
            what,
            &mut *slot,
            |slot| {
                // 旧连接连同语句缓存一起丢弃
                *slot = None;
                *slot = Some(Self::connect(path)?);
                tracing::info!("SQLite reconnected: {:?}", path);
                Ok(())
            },
            |slot| match slot.as_mut() {
                Some(conn) => op(conn).map_err(GatewayError::from),
                None => Err(GatewayError::Backend("not connected".into())),
            },
        )
    }
}

impl Gateway for SqliteGateway {
    fn table(&self) -> &str {
        &self.table
    }

    fn insert(&self, row: &HoldingRow) -> Result<i64, GatewayError> {
        let sql = &self.sql.insert;
        self.with_conn("insert", |c| {
            c.prepare_cached(sql)?.execute(params![
                row.channel,
                row.kind,
                row.start,
                row.end,
                row.day,
                now_ms()
            ])?;
            Ok(c.last_insert_rowid())
        })
    }

    fn update_start(&self, id: i64, start: i64) -> Result<usize, GatewayError> {
        let sql = &self.sql.update_start;
        self.with_conn("update_start", |c| {
            c.prepare_cached(sql)?.execute(params![id, start, now_ms()])
        })
    }

    fn update_end(&self, id: i64, end: i64) -> Result<usize, GatewayError> {
        let sql = &self.sql.update_end;
        self.with_conn("update_end", |c| {
            c.prepare_cached(sql)?.execute(params![id, end, now_ms()])
        })
    }

    fn update_both(&self, id: i64, start: i64, end: i64) -> Result<usize, GatewayError> {
        let sql = &self.sql.update_both;
        self.with_conn("update_both", |c| {
            c.prepare_cached(sql)?.execute(params![id, start, end, now_ms()])
        })
    }

    fn delete(&self, id: i64) -> Result<usize, GatewayError> {
        let sql = &self.sql.delete;
        self.with_conn("delete", |c| c.prepare_cached(sql)?.execute(params![id]))
    }

    fn select_by_id(&self, id: i64) -> Result<Option<HoldingRow>, GatewayError> {
        let sql = &self.sql.select_by_id;
        self.with_conn("select_by_id", |c| {
            c.prepare_cached(sql)?.query_row(params![id], map_row).optional()
        })
    }

    fn exists_by_id(&self, id: i64) -> Result<bool, GatewayError> {
        let sql = &self.sql.exists;
        self.with_conn("exists_by_id", |c| c.prepare_cached(sql)?.exists(params![id]))
    }

    fn select_since(&self, since_ms: i64) -> Result<Vec<HoldingRow>, GatewayError> {
        let sql = &self.sql.select_since;
        self.with_conn("select_since", |c| {
            let mut stmt = c.prepare_cached(sql)?;
            let rows = stmt.query_map(params![since_ms], map_row)?;
            let out: rusqlite::Result<Vec<HoldingRow>> = rows.collect();
            out
        })
    }

    fn copy_then_delete(&self, dest_table: &str, ids: &[i64]) -> Result<usize, GatewayError> {
        validate_table_name(dest_table)?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.ensure_table(dest_table)?;

        let src = &self.table;
        let copy = format!(
            "INSERT OR REPLACE INTO {dest_table} (id, channel, type, start_ms, end_ms, day, updated_ms)
             SELECT id, channel, type, start_ms, end_ms, day, updated_ms FROM {src} WHERE id = ?1"
        );
        let delete = &self.sql.delete;

        let mut moved = 0usize;
        for chunk in ids.chunks(ARCHIVE_BATCH) {
            moved += self.with_conn("copy_then_delete", |c| {
                let tx = c.transaction()?;
                let mut n = 0usize;
                {
                    let mut cp = tx.prepare_cached(&copy)?;
                    let mut del = tx.prepare_cached(delete)?;
                    for id in chunk {
                        if cp.execute(params![id])? > 0 {
                            n += del.execute(params![id])?;
                        }
                    }
                }
                tx.commit()?;
                Ok(n)
            })?;
        }
        tracing::info!(
            "Archived {} rows from {} to {}",
            moved,
            self.table,
            dest_table
        );
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-15T00:00:00Z
    const BASE: i64 = 1_700_006_400_000;

    fn row(start: i64, end: i64) -> HoldingRow {
        HoldingRow {
            id: 0,
            channel: "USAAA  BHZ00".into(),
            kind: "AA".into(),
            start,
            end,
            day: 19_676,
        }
    }

    fn open_tmp(dir: &tempfile::TempDir) -> SqliteGateway {
        SqliteGateway::open(dir.path().join("holdings.db"), "holdings", RetryPolicy::immediate(2)).unwrap()
    }

    #[test]
    fn insert_update_select_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let gw = open_tmp(&dir);

        let id = gw.insert(&row(BASE, BASE + 10_000)).unwrap();
        assert!(id > 0);
        assert_eq!(gw.update_end(id, BASE + 20_000).unwrap(), 1);
        assert_eq!(gw.update_start(id, BASE - 5_000).unwrap(), 1);

        let got = gw.select_by_id(id).unwrap().unwrap();
        assert_eq!(got.start, BASE - 5_000);
        assert_eq!(got.end, BASE + 20_000);
        assert_eq!(got.channel, "USAAA  BHZ00");
        assert!(gw.exists_by_id(id).unwrap());

        assert_eq!(gw.delete(id).unwrap(), 1);
        assert_eq!(gw.update_both(id, 0, 1).unwrap(), 0);
        assert!(gw.select_by_id(id).unwrap().is_none());
    }

    #[test]
    fn dropped_connection_reconnects_and_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let gw = open_tmp(&dir);
        let id = gw.insert(&row(BASE, BASE + 1_000)).unwrap();

        gw.drop_connection();
        assert_eq!(gw.update_end(id, BASE + 2_000).unwrap(), 1);
        assert_eq!(gw.select_by_id(id).unwrap().unwrap().end, BASE + 2_000);
    }

    #[test]
    fn closed_gateway_refuses_calls() {
        let dir = tempfile::tempdir().unwrap();
        let gw = open_tmp(&dir);
        gw.close();
        assert!(matches!(gw.select_by_id(1), Err(GatewayError::Closed)));
    }

    #[test]
    fn select_since_filters_by_end() {
        let dir = tempfile::tempdir().unwrap();
        let gw = open_tmp(&dir);
        gw.insert(&row(BASE, BASE + 1_000)).unwrap();
        gw.insert(&row(BASE + 5_000, BASE + 9_000)).unwrap();

        assert_eq!(gw.select_since(BASE + 2_000).unwrap().len(), 1);
        assert_eq!(gw.select_since(0).unwrap().len(), 2);
    }

    #[test]
    fn copy_then_delete_moves_into_archive_table() {
        let dir = tempfile::tempdir().unwrap();
        let gw = open_tmp(&dir);
        let a = gw.insert(&row(BASE, BASE + 1_000)).unwrap();
        let b = gw.insert(&row(BASE + 5_000, BASE + 6_000)).unwrap();

        assert_eq!(gw.copy_then_delete("holdingsarchive", &[a]).unwrap(), 1);
        assert!(gw.select_by_id(a).unwrap().is_none());
        assert!(gw.select_by_id(b).unwrap().is_some());

        let archive =
            SqliteGateway::open(gw.path().to_path_buf(), "holdingsarchive", RetryPolicy::default()).unwrap();
        let moved = archive.select_by_id(a).unwrap().unwrap();
        assert_eq!(moved.start, BASE);
    }
}
