//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::connection_manager::ConnectionStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub server_id: String,
    pub backends: BackendsResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<DependencyHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct BackendsResponse {
    pub store: &'static str,
    pub broker: &'static str,
    pub presence: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DependencyHealth {
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub connected: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub unique_users: usize,
    pub channels_count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: ConnectionStats,
    /// Users online on any process; absent when presence is unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_users: Option<usize>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let conn_stats = state.connection_manager.stats();

    let redis = match state.redis_pool {
        Some(ref pool) => Some(DependencyHealth {
            connected: pool.ping().await.is_ok(),
        }),
        None => None,
    };

    let postgres = match state.postgres_pool {
        Some(ref pool) => {
            let inner = pool.pool();
            Some(PostgresHealthResponse {
                connected: pool.ping().await.is_ok(),
                pool_size: inner.size(),
                idle_connections: inner.num_idle() as u32,
            })
        }
        None => None,
    };

    let healthy = redis.as_ref().map(|r| r.connected).unwrap_or(true)
        && postgres.as_ref().map(|p| p.connected).unwrap_or(true);

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        server_id: state.settings.server.id.clone(),
        backends: BackendsResponse {
            store: state.store.backend_name(),
            broker: state.connection_manager.bridge().broker().backend_name(),
            presence: state.presence.backend_name(),
        },
        redis,
        postgres,
        connections: ConnectionHealthResponse {
            total: conn_stats.total_sessions,
            unique_users: conn_stats.unique_users,
            channels_count: conn_stats.channels.len(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let online_users = match state.presence.list_online().await {
        Ok(online) => Some(online.len()),
        Err(e) => {
            tracing::warn!(error = %e, "Presence snapshot unavailable");
            None
        }
    };

    Json(StatsResponse {
        connections: state.connection_manager.stats(),
        online_users,
    })
}
