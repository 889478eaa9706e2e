pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use monitoring::{AVAILABILITY_METRICS, COMPACTION_METRICS, PIPELINE_METRICS, QUEUE_METRICS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

// Health endpoint handler
async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|err| {
        error!(event = "metrics_encode_failed", error = %err, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub depth: BTreeMap<String, u64>,
}

async fn queue_stats(state: State<Arc<AppState>>) -> Json<QueueStats> {
    Json(QueueStats {
        depth: state.queues.depths(),
    })
}

/// Registers every metric family once per process.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;

    QUEUE_METRICS
        .get_or_init(|| async { monitoring::QueueMetrics::register(&mut registry, "queue") })
        .await;

    COMPACTION_METRICS
        .get_or_init(|| async {
            monitoring::CompactionMetrics::register(&mut registry, "compaction")
        })
        .await;

    PIPELINE_METRICS
        .get_or_init(|| async {
            monitoring::PipelineMetrics::register(&mut registry, "pipeline")
        })
        .await;

    AVAILABILITY_METRICS
        .get_or_init(|| async {
            monitoring::AvailabilityMetrics::register(&mut registry, "availability")
        })
        .await;

    monitoring::register_build_info_metric(&mut registry, "pipeline_worker");
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .route("/queue/stats", get(queue_stats))
        .with_state(state)
}

/// Starts the health/metrics HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(event = "server_listening", addr = %addr, "Monitoring server listening");
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "server_failed", error = %err, "Monitoring server stopped with error");
        }
    });

    Ok(server_handle)
}
