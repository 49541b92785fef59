//! Publish/subscribe transport shared by every server process.
//!
//! A topic is a plain string (`chat:{channel_id}`); payloads are UTF-8 JSON.
//! Subscribing yields a stream that ends when the underlying connection is
//! lost, and dropping the stream releases the subscription.

mod memory_backend;
mod redis_backend;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::config::BrokerConfig;
use crate::redis::{PoolError, RedisPool};

pub use memory_backend::MemoryBroker;
pub use redis_backend::RedisBroker;

/// Payloads received on one topic subscription.
pub type PayloadStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] PoolError),

    /// Backend is temporarily unavailable
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend type identifier, used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Publish a payload. Returns how many subscribers received it.
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError>;

    /// Subscribe to a topic. The subscription is live once this returns.
    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BrokerError>;
}

/// Create a broker based on configuration.
///
/// - `"redis"`: requires a Redis pool; falls back to memory without one
/// - `"memory"` (default): a process-local [`MemoryBroker`]
pub fn create_broker(config: &BrokerConfig, redis_pool: Option<Arc<RedisPool>>) -> Arc<dyn Broker> {
    match config.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(backend = "redis", url = %pool.url_masked(), "Creating Redis broker");
                Arc::new(RedisBroker::new(pool))
            } else {
                tracing::warn!("Redis broker requested but no pool provided, falling back to memory");
                Arc::new(MemoryBroker::new())
            }
        }
        other => {
            if other != "memory" {
                tracing::warn!(backend = %other, "Unknown broker backend, using memory");
            }
            tracing::info!(backend = "memory", "Creating in-memory broker");
            Arc::new(MemoryBroker::new())
        }
    }
}
