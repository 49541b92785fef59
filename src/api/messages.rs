//! Chat history and channel notification endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{ChannelId, Message, User};
use crate::error::{AppError, Result};
use crate::server::{AppState, AuthenticatedUser};
use crate::websocket::DeliveryEvent;

const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub skip: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub channel_id: ChannelId,
    pub outcome: &'static str,
}

async fn require_membership(state: &AppState, user: &User, channel_id: ChannelId) -> Result<()> {
    if state.store.is_member(user.id, channel_id).await? {
        Ok(())
    } else {
        Err(AppError::Forbidden("Not a member of this channel".to_string()))
    }
}

/// GET /api/v1/channels/{id}/messages - newest first
#[tracing::instrument(name = "api.list_messages", skip(state, user), fields(user_id = user.id))]
pub async fn list_messages(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(channel_id): Path<ChannelId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>> {
    if !(1..=MAX_PAGE_SIZE).contains(&query.limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    if query.skip < 0 {
        return Err(AppError::Validation("skip must not be negative".to_string()));
    }

    require_membership(&state, &user, channel_id).await?;
    let messages = state
        .store
        .list_messages(channel_id, query.limit, query.skip)
        .await?;
    Ok(Json(messages))
}

/// POST /api/v1/channels/{id}/read - mark other members' messages as read
#[tracing::instrument(name = "api.mark_read", skip(state, user), fields(user_id = user.id))]
pub async fn mark_read(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(channel_id): Path<ChannelId>,
) -> Result<Json<Vec<Message>>> {
    require_membership(&state, &user, channel_id).await?;
    let updated = state.store.mark_channel_read(channel_id, user.id).await?;

    if !updated.is_empty() {
        let ids: Vec<i64> = updated.iter().map(|m| m.id).collect();
        let receipt = DeliveryEvent::read_receipt(channel_id, user.id, &ids);
        if let Err(e) = state.connection_manager.publish(channel_id, receipt).await {
            tracing::warn!(error = %e, "Read receipt not delivered");
        }
    }

    Ok(Json(updated))
}

/// POST /api/v1/channels/{id}/notify - publish a notification to a channel
#[tracing::instrument(name = "api.notify_channel", skip(state, request))]
pub async fn notify_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<ChannelId>,
    Json(request): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>> {
    if state.store.find_channel(channel_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Channel {} not found", channel_id)));
    }

    let event = DeliveryEvent::notification(channel_id, request.data);
    let outcome = state.connection_manager.publish(channel_id, event).await?;

    Ok(Json(NotifyResponse {
        channel_id,
        outcome: outcome.as_str(),
    }))
}
