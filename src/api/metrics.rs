//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics::{self, MemoryMetrics, SessionMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_metrics_from_state(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Refresh gauges that are derived from current state
fn update_metrics_from_state(state: &AppState) {
    let conn_stats = state.connection_manager.stats();
    SessionMetrics::set_counts(
        conn_stats.total_sessions,
        conn_stats.unique_users,
        conn_stats.channels.len(),
    );

    if let Some(ref pool) = state.redis_pool {
        metrics::REDIS_CONNECTION_STATUS.set(if pool.is_connected() { 1 } else { 0 });
    }

    MemoryMetrics::update_process_memory();
}
