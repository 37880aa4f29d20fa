//! HTTP receiver for event submissions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use super::gateway::IngestionGateway;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::metrics;
use crate::processors::{ProcessorChain, UnitStats};

/// Body of a `202 Accepted` submission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub count: usize,
    pub received: String,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    buffer_depth: usize,
    buffer_capacity: usize,
    accepting: bool,
    units: Vec<UnitStats>,
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<IngestionGateway>,
    chain: Option<Arc<ProcessorChain>>,
}

pub struct HttpReceiver {
    state: AppState,
    config: ServerConfig,
}

impl HttpReceiver {
    pub fn new(config: ServerConfig, gateway: Arc<IngestionGateway>) -> Self {
        Self {
            state: AppState {
                gateway,
                chain: None,
            },
            config,
        }
    }

    /// Exposes the chain's per-unit counters on `/stats`.
    pub fn with_chain(mut self, chain: Arc<ProcessorChain>) -> Self {
        self.state.chain = Some(chain);
        self
    }

    pub fn create_router(&self) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.request_timeout_secs,
            )));

        Router::new()
            .route(&self.config.events_path, post(ingest_events))
            .route("/health", get(health_check))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .layer(middleware)
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            "HTTP receiver listening on {} (events at {})",
            listener.local_addr()?,
            self.config.events_path
        );
        axum::serve(listener, self.create_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("HTTP receiver stopped");
        Ok(())
    }
}

/// Accepts one event object or an array of them.
async fn ingest_events(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>)> {
    let receipt = state.gateway.submit(&body)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            status: "accepted".to_string(),
            count: receipt.count,
            received: receipt.received.to_rfc3339_opts(SecondsFormat::Secs, true),
        }),
    ))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        buffer_depth: state.gateway.len(),
        buffer_capacity: state.gateway.capacity(),
        accepting: state.gateway.is_accepting(),
        units: state.chain.as_ref().map(|c| c.stats()).unwrap_or_default(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
