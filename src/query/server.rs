use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::index::{Holding, HoldingIndex};
use crate::stats::StatsReport;

#[derive(Deserialize)]
pub struct ContainsParams {
    /// 逗号分隔可查询多个 channel（全部覆盖才算）；缺省 = 任意 channel
    pub channel: Option<String>,
    pub time: i64,
    pub dur: Option<i64>,
}

#[derive(Serialize, Deserialize)]
pub struct ContainsResponse {
    pub channel: Option<String>,
    pub time: i64,
    pub dur: i64,
    pub contained: bool,
}

#[derive(Deserialize)]
pub struct HoldingsParams {
    pub filter: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct HoldingView {
    pub id: i64,
    pub channel: String,
    pub kind: String,
    pub start: i64,
    pub end: i64,
    pub dirty: bool,
}

impl From<&Holding> for HoldingView {
    fn from(h: &Holding) -> Self {
        Self {
            id: h.id(),
            channel: h.channel().to_string(),
            kind: h.kind().to_string(),
            start: h.start(),
            end: h.end(),
            dirty: h.is_dirty(),
        }
    }
}

/// 只读状态接口：`/status`、`/contains`、`/holdings`
pub struct StatusServer {
    pub index: Arc<HoldingIndex>,
}

impl StatusServer {
    pub fn new(index: Arc<HoldingIndex>) -> Self {
        Self { index }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/contains", get(contains_handler))
            .route("/holdings", get(holdings_handler))
            .with_state(self.index.clone())
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("HTTP status server listening on port {}", port);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn status_handler(State(index): State<Arc<HoldingIndex>>) -> Json<StatsReport> {
    Json(index.report())
}

async fn contains_handler(
    Query(params): Query<ContainsParams>,
    State(index): State<Arc<HoldingIndex>>,
) -> Json<ContainsResponse> {
    let dur = params.dur.unwrap_or(0);
    let contained = match params.channel.as_deref() {
        Some(list) if list.contains(',') => {
            let channels: Vec<&str> = list.split(',').collect();
            index.contains_fully_all(&channels, params.time, dur)
        }
        Some(one) => index.contains_fully(Some(one), params.time, dur),
        None => index.contains_fully(None, params.time, dur),
    };
    Json(ContainsResponse {
        channel: params.channel,
        time: params.time,
        dur,
        contained,
    })
}

async fn holdings_handler(
    Query(params): Query<HoldingsParams>,
    State(index): State<Arc<HoldingIndex>>,
) -> Json<Vec<HoldingView>> {
    let limit = params.limit.unwrap_or(1000);
    let list = index
        .holdings(params.filter.as_deref())
        .iter()
        .take(limit)
        .map(HoldingView::from)
        .collect();
    Json(list)
}
