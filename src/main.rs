use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holdings_index::config::{Config, MaintenanceConfig};
use holdings_index::core::now_ms;
use holdings_index::event::SpanStream;
use holdings_index::index::{CapacityGovernor, HoldingIndex};
use holdings_index::query::StatusServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "holdings-index")]
#[command(about = "Channel holdings index with write-behind persistence")]
struct Cli {
    /// 配置文件（缺省：./holdings-index.toml 或用户配置目录）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// 从 stdin 读 span 行（CHANNEL|TYPE|epoch_ms|duration_ms），后台维护
    Run,
    /// 只做维护：合并 / 写回 / 清理 / 容量调节
    Maintain {
        #[arg(long)]
        once: bool,
    },
    /// 打印内存中的区间
    Dump {
        /// channel 过滤，支持 * ?
        filter: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// 按天把碎片区间挪到归档表
    Archive {
        #[arg(long)]
        target_per_day: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;

    let gateway = Arc::new(cfg.open_gateway()?);
    let index = Arc::new(cfg.build_index(gateway.clone()));
    let since = now_ms() - cfg.maintenance.purge_age_secs.saturating_mul(1000);
    let loaded = index.load_from_store(since).context("loading holdings")?;
    info!("[{}] {} holdings loaded from {:?}", index.tag(), loaded, gateway.path());

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(index.clone(), &cfg).await,
        Command::Maintain { once } => maintain(index.clone(), &cfg, once).await,
        Command::Dump { filter, json } => dump(&index, filter.as_deref(), json),
        Command::Archive { target_per_day } => {
            let target = target_per_day.unwrap_or(cfg.governor.target_per_day);
            anyhow::ensure!(target > 0, "target_per_day must be > 0");
            let moved =
                index.move_excess_to_archive(target, gateway.as_ref(), &cfg.store.archive_table);
            println!("{} holdings moved to {}", moved, cfg.store.archive_table);
            Ok(())
        }
    };

    let idx = index.clone();
    let flushed = tokio::task::spawn_blocking(move || idx.close()).await?;
    info!("[{}] shutdown: {} holdings flushed", index.tag(), flushed);
    info!("\n{}", index.report());
    gateway.close();
    result
}

async fn run(index: Arc<HoldingIndex>, cfg: &Config) -> anyhow::Result<()> {
    if cfg.server.port > 0 {
        let server = StatusServer::new(index.clone());
        let port = cfg.server.port;
        tokio::spawn(async move {
            if let Err(e) = server.run(port).await {
                tracing::error!("status server stopped: {}", e);
            }
        });
    }

    let maint = tokio::spawn(maintenance_loop(index.clone(), cfg.clone()));
    let stream = SpanStream::new(index.clone()).run(tokio::io::BufReader::new(tokio::io::stdin()));
    info!("[{}] reading spans from stdin", index.tag());

    tokio::select! {
        summary = stream => {
            let summary = summary?;
            info!("[{}] input finished: {:?}", index.tag(), summary);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }
    maint.abort();
    Ok(())
}

async fn maintain(index: Arc<HoldingIndex>, cfg: &Config, once: bool) -> anyhow::Result<()> {
    if once {
        let governor = cfg.governor();
        let m = cfg.maintenance.clone();
        tokio::task::spawn_blocking(move || maintenance_pass(&index, &m, governor.as_ref()))
            .await?;
        return Ok(());
    }
    tokio::select! {
        _ = maintenance_loop(index, cfg.clone()) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }
    Ok(())
}

async fn maintenance_loop(index: Arc<HoldingIndex>, cfg: Config) {
    let governor = cfg.governor().map(Arc::new);
    let m = cfg.maintenance;
    let mut ticker = tokio::time::interval(Duration::from_secs(m.interval_secs.max(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let (idx, m, gov) = (index.clone(), m.clone(), governor.clone());
        if let Err(e) =
            tokio::task::spawn_blocking(move || maintenance_pass(&idx, &m, gov.as_deref()))
                .await
        {
            tracing::error!("maintenance pass panicked: {}", e);
        }
    }
}

/// 一轮维护；每一步都有上限，耗时不随索引规模增长
fn maintenance_pass(index: &HoldingIndex, m: &MaintenanceConfig, governor: Option<&CapacityGovernor>) {
    let merged = index.consolidate(m.max_merges, m.assume_ordered);
    let written = index.keep_writing(m.write_min_age_secs, m.write_max_per_call);
    let purged = index.purge_old(m.purge_age_secs);
    let archived = governor.map_or(0, |g| g.run(index));
    if merged + written + purged + archived > 0 {
        info!(
            "[{}] maintenance: {} merged, {} written, {} purged, {} archived, {} in memory",
            index.tag(),
            merged,
            written,
            purged,
            archived,
            index.size()
        );
    }
}

fn dump(index: &HoldingIndex, filter: Option<&str>, json: bool) -> anyhow::Result<()> {
    if json {
        let rows: Vec<_> = index.holdings(filter).iter().map(|h| h.to_row()).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", index.dump(filter));
    }
    Ok(())
}
