use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AlertLimiter;
use crate::index::{CapacityGovernor, HoldingIndex, HoldingStore};
use crate::storage::{validate_table_name, RetryPolicy, SqliteGateway};

pub const DEFAULT_CONFIG_FILE: &str = "holdings-index.toml";

/// 全部配置项都有默认值；配置文件可只写需要覆盖的部分。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub index: IndexConfig,
    pub maintenance: MaintenanceConfig,
    pub governor: GovernorConfig,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub table: String,
    pub archive_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("holdings.db"),
            table: "holdings".to_string(),
            archive_table: "holdingsarchive".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub tag: String,
    pub day_bound: bool,
    pub defer_updates: bool,
    /// false = 不自动写：所有变更只置脏，由维护循环落库
    pub auto_write: bool,
    pub grow_chunk: usize,
    pub vanish_grace_hours: u64,
    pub alert_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            tag: "holdings".to_string(),
            day_bound: true,
            defer_updates: false,
            auto_write: true,
            grow_chunk: 1000,
            vanish_grace_hours: 72,
            alert_interval_secs: 7200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
    /// 0 = 不限
    pub max_merges: usize,
    pub assume_ordered: bool,
    pub purge_age_secs: i64,
    pub write_min_age_secs: i64,
    pub write_max_per_call: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_merges: 1000,
            assume_ordered: true,
            purge_age_secs: 3 * 86_400,
            write_min_age_secs: 60,
            write_max_per_call: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// 0 = 关闭
    pub target_per_day: usize,
    pub keep_floor_secs: u64,
    pub excess_factor: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            target_per_day: 0,
            keep_floor_secs: 120,
            excess_factor: 5,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 0 = 不启动 HTTP 状态接口
    pub port: u16,
}

impl Config {
    /// 显式路径必须存在；未指定时依次查找当前目录与用户配置目录，都没有则用默认值。
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => {
                    tracing::info!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|d| d.join("holdings-index").join("config.toml"))
            .filter(|p| p.exists())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_table_name(&self.store.table)?;
        validate_table_name(&self.store.archive_table)?;
        anyhow::ensure!(
            self.store.table != self.store.archive_table,
            "archive_table must differ from table"
        );
        anyhow::ensure!(self.retry.max_attempts >= 1, "retry.max_attempts must be >= 1");
        anyhow::ensure!(self.index.grow_chunk >= 1, "index.grow_chunk must be >= 1");
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.backoff_ms),
        )
    }

    pub fn open_gateway(&self) -> anyhow::Result<SqliteGateway> {
        SqliteGateway::open(&self.store.path, &self.store.table, self.retry_policy())
            .with_context(|| format!("opening store {}", self.store.path.display()))
    }

    /// 按 `[index]` 组装索引（网关由调用方决定，便于测试注入内存网关）
    pub fn build_index(&self, gateway: Arc<dyn crate::storage::Gateway>) -> HoldingIndex {
        let ix = &self.index;
        let store = HoldingStore::new(gateway)
            .with_auto_write(ix.auto_write)
            .with_day_bound(ix.day_bound)
            .with_vanish_grace(Duration::from_secs(ix.vanish_grace_hours * 3600))
            .with_alerts(Arc::new(AlertLimiter::new(Duration::from_secs(
                ix.alert_interval_secs,
            ))));
        let index = HoldingIndex::new(store)
            .with_grow_chunk(ix.grow_chunk)
            .with_tag(&ix.tag);
        index.set_defer_update(ix.defer_updates);
        index
    }

    pub fn governor(&self) -> Option<CapacityGovernor> {
        let g = &self.governor;
        (g.target_per_day > 0).then(|| {
            CapacityGovernor::new(g.target_per_day, &self.store.archive_table)
                .with_keep_floor(Duration::from_secs(g.keep_floor_secs))
                .with_excess_factor(g.excess_factor)
        })
    }
}
