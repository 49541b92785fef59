//! Redis pub/sub broker.
//!
//! Publishing goes through the shared multiplexed connection. Every
//! subscription opens its own pub/sub connection, so dropping the returned
//! stream closes that connection and unsubscribes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;

use crate::metrics::{BackendMetrics, REDIS_CONNECTION_STATUS};
use crate::redis::RedisPool;

use super::{Broker, BrokerError, PayloadStream};

pub struct RedisBroker {
    pool: Arc<RedisPool>,
}

impl RedisBroker {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError> {
        let started = Instant::now();
        let topic_owned = topic.to_string();
        let payload = payload.to_string();

        let result = self
            .pool
            .execute(|mut conn| async move { conn.publish::<_, _, usize>(topic_owned, payload).await })
            .await;

        BackendMetrics::record_latency("redis", "publish", started.elapsed().as_secs_f64());
        REDIS_CONNECTION_STATUS.set(if self.pool.is_connected() { 1 } else { 0 });

        result.map_err(|e| {
            BackendMetrics::record_error("redis", "publish");
            tracing::warn!(topic = %topic, error = %e, "Redis publish failed");
            BrokerError::Pool(e)
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BrokerError> {
        let mut pubsub = self.pool.client().get_async_pubsub().await.map_err(|e| {
            BackendMetrics::record_error("redis", "subscribe");
            BrokerError::Redis(e)
        })?;
        pubsub.subscribe(topic).await?;

        tracing::debug!(topic = %topic, "Redis subscription established");

        let topic = topic.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let topic = topic.clone();
            async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Non-UTF-8 payload skipped");
                        None
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
