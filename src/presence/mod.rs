//! Cross-process presence: which users have at least one open session on
//! any server process.
//!
//! Each process records itself as a holder of a user while it owns one of
//! that user's sessions; the user is online while any holder remains. All
//! updates are set add/remove, so replays are harmless. Entries left by a
//! crashed process stay until they are reaped externally.

mod memory_backend;
mod redis_backend;
mod tracker;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::chat::UserId;
use crate::config::{PresenceConfig, RedisConfig};
use crate::redis::{PoolError, RedisPool};

pub use memory_backend::MemoryPresenceStore;
pub use redis_backend::RedisPresenceStore;
pub use tracker::{PresenceAck, PresenceOp, PresenceTracker, PresenceUpdate, PresenceWriterConfig};

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] PoolError),

    /// The writer task is gone or gave up on the update
    #[error("Presence update not applied: {0}")]
    Unavailable(String),
}

/// Shared presence state, scoped to the calling server process.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Record this process as holding a session of `user_id`.
    async fn add(&self, user_id: UserId) -> Result<(), PresenceError>;

    /// Drop this process as a holder; the user goes offline when no holder
    /// remains.
    async fn remove(&self, user_id: UserId) -> Result<(), PresenceError>;

    async fn members(&self) -> Result<BTreeSet<UserId>, PresenceError>;

    async fn contains(&self, user_id: UserId) -> Result<bool, PresenceError>;
}

/// Create a presence store based on configuration.
pub fn create_presence_store(
    config: &PresenceConfig,
    redis_config: &RedisConfig,
    server_id: &str,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn PresenceStore> {
    match config.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    key = %redis_config.presence_key,
                    server_id = %server_id,
                    "Creating Redis presence store"
                );
                Arc::new(RedisPresenceStore::new(
                    pool,
                    redis_config.presence_key.clone(),
                    server_id.to_string(),
                ))
            } else {
                tracing::warn!(
                    "Redis presence requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryPresenceStore::new(server_id))
            }
        }
        other => {
            if other != "memory" {
                tracing::warn!(backend = %other, "Unknown presence backend, using memory");
            }
            tracing::info!(backend = "memory", server_id = %server_id, "Creating in-memory presence store");
            Arc::new(MemoryPresenceStore::new(server_id))
        }
    }
}
