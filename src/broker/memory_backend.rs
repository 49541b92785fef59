//! In-process broker built on `tokio::sync::broadcast`.
//!
//! Several connection managers sharing one `MemoryBroker` behave like
//! server processes sharing one Redis instance, which is how the
//! integration tests exercise cross-process fan-out.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{Broker, BrokerError, PayloadStream};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Per-topic buffer; a subscriber that falls further behind skips ahead.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError> {
        let receivers = match self.topics.get(topic) {
            Some(tx) => tx.send(payload.to_string()).unwrap_or(0),
            None => 0,
        };

        if receivers == 0 {
            self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
        }
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BrokerError> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topic = topic.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let topic = topic.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %topic, skipped = skipped, "Subscriber lagged, payloads skipped");
                        None
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
