//! Presence endpoint.

use axum::{extract::State, Json};

use crate::chat::UserId;
use crate::error::Result;
use crate::server::AppState;

/// GET /online-users - ids of every user online on any process
pub async fn online_users(State(state): State<AppState>) -> Result<Json<Vec<UserId>>> {
    let online = state.presence.list_online().await?;
    Ok(Json(online.into_iter().collect()))
}
