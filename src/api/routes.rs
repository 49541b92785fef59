use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::health::{health, stats};
use super::messages::{list_messages, mark_read, notify_channel};
use super::metrics::prometheus_metrics;
use super::presence::online_users;

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Presence
        .route("/online-users", get(online_users))
        .nest(
            "/api/v1",
            Router::new()
                // Bearer-authenticated chat history
                .route("/channels/{id}/messages", get(list_messages))
                .route("/channels/{id}/read", post(mark_read))
                // Server-to-server notification trigger
                .merge(
                    Router::new()
                        .route("/channels/{id}/notify", post(notify_channel))
                        .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
                ),
        )
}
