//! Chat persistence collaborator.
//!
//! The delivery layer only reaches users, channels and messages through the
//! [`ChatStore`] trait. Two backends are provided:
//! - `memory`: process-local maps, for single-process deployments and tests
//! - `postgres`: sqlx-backed tables created on startup

mod memory_backend;
mod postgres_backend;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::chat::{Channel, ChannelId, Message, MessageStatus, User, UserId, UserStatus};
use crate::config::DatabaseConfig;
use crate::postgres::PostgresPool;

pub use memory_backend::MemoryChatStore;
pub use postgres_backend::PostgresChatStore;

/// Errors that can occur during chat store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("Message {0} not found")]
    MessageNotFound(i64),

    /// Message status updates only move forward
    #[error("Message status cannot move from {from} to {to}")]
    StatusRegression {
        from: MessageStatus,
        to: MessageStatus,
    },

    /// A stored row holds a value this service does not understand
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence interface for users, channels and messages.
///
/// Implementations must be thread-safe (`Send + Sync`) as they are shared by
/// every connection task and REST handler.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Backend type identifier, used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StoreError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn find_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>, StoreError>;

    async fn is_member(&self, user_id: UserId, channel_id: ChannelId) -> Result<bool, StoreError>;

    /// Persist a new message with status `Sent`.
    async fn create_message(
        &self,
        channel_id: ChannelId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Update a user's durable status.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UserNotFound` for an unknown user.
    async fn set_user_status(&self, user_id: UserId, status: UserStatus) -> Result<(), StoreError>;

    /// Messages of a channel, newest first.
    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<Message>, StoreError>;

    /// Mark every message in the channel sent by someone other than `reader`
    /// as read. Returns the messages that changed.
    async fn mark_channel_read(
        &self,
        channel_id: ChannelId,
        reader: UserId,
    ) -> Result<Vec<Message>, StoreError>;

    /// Move a message's status forward. Re-applying the current status is a
    /// no-op; anything that would move it backwards is rejected with
    /// `StoreError::StatusRegression`.
    async fn advance_message_status(
        &self,
        message_id: i64,
        status: MessageStatus,
    ) -> Result<Message, StoreError>;
}

/// Create a chat store based on configuration.
///
/// - `"postgres"`: requires a connected pool; falls back to memory without one
/// - `"memory"` (default): an empty [`MemoryChatStore`]
pub fn create_chat_store(
    config: &DatabaseConfig,
    postgres_pool: Option<PostgresPool>,
) -> Arc<dyn ChatStore> {
    match config.backend.as_str() {
        "postgres" => {
            if let Some(pool) = postgres_pool {
                tracing::info!(backend = "postgres", "Creating PostgreSQL chat store");
                Arc::new(PostgresChatStore::new(pool))
            } else {
                tracing::warn!(
                    "PostgreSQL chat store requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryChatStore::new())
            }
        }
        other => {
            if other != "memory" {
                tracing::warn!(backend = %other, "Unknown chat store backend, using memory");
            }
            tracing::info!(backend = "memory", "Creating in-memory chat store");
            Arc::new(MemoryChatStore::new())
        }
    }
}
