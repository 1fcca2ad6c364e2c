//! Metrics server.
//!
//! Serves the Prometheus text exposition of [`ProbeMetrics`] and a liveness
//! endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::metrics::ProbeMetrics;
use crate::scheduler::stopped;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Create the Axum router with all routes.
pub fn create_router(metrics: Arc<ProbeMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .with_state(metrics)
}

/// Serve `router` on `addr` until `stop` turns true.
///
/// # Errors
/// Returns `std::io::Error` if the listener cannot be bound or the server fails.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Metrics server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(stopped(stop))
        .await?;

    tracing::info!("Metrics server stopped");
    Ok(())
}

/// Prometheus scrape endpoint.
async fn metrics_handler(State(metrics): State<Arc<ProbeMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, metrics.content_type())], body).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
