use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, PayloadStream};
use crate::chat::ChannelId;
use crate::config::{BrokerConfig, RedisConfig};
use crate::metrics::BrokerMetrics;
use crate::redis::{retry_with_backoff, BackoffConfig, ExponentialBackoff};
use crate::websocket::DeliveryEvent;

use super::ChannelSink;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub topic_prefix: String,
    pub publish_attempts: u32,
    /// Delays between publish retries and between resubscribe attempts
    pub backoff: BackoffConfig,
    /// Upper bound a publish waits for a new subscription to go live
    pub live_wait: Duration,
}

impl FanoutConfig {
    pub fn from_settings(redis: &RedisConfig, broker: &BrokerConfig) -> Self {
        Self {
            topic_prefix: redis.topic_prefix.clone(),
            publish_attempts: broker.publish_attempts,
            backoff: BackoffConfig::with_delays(
                broker.retry_initial_delay_ms,
                broker.retry_max_delay_ms,
            ),
            live_wait: Duration::from_millis(broker.subscribe_wait_ms),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "chat".to_string(),
            publish_attempts: 3,
            backoff: BackoffConfig::default(),
            live_wait: Duration::from_secs(2),
        }
    }
}

/// Identifies the bridge that published a payload and the publish itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PayloadOrigin {
    process: Uuid,
    sequence: u64,
}

/// Broker payload: the outbound event with its origin alongside
#[derive(Serialize)]
struct OutboundPayload<'a> {
    #[serde(flatten)]
    event: &'a DeliveryEvent,
    origin: PayloadOrigin,
}

#[derive(Deserialize)]
struct InboundPayload {
    #[serde(flatten)]
    event: DeliveryEvent,
    #[serde(default)]
    origin: Option<PayloadOrigin>,
}

/// Owns one channel's subscription task. Dropping the handle cancels it.
pub struct SubscriptionHandle {
    channel_id: ChannelId,
    generation: u64,
    cancel: CancellationToken,
    live: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the broker subscription is currently established.
    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Watch for the subscription going live (or dropping out).
    pub fn live_signal(&self) -> watch::Receiver<bool> {
        self.live.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to release its broker subscription.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(channel_id = self.channel_id, error = %e, "Subscription task failed");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct FanoutBridge {
    broker: Arc<dyn Broker>,
    config: FanoutConfig,
    /// Tags every payload this bridge publishes
    origin: Uuid,
    sequence: AtomicU64,
}

impl FanoutBridge {
    pub fn new(broker: Arc<dyn Broker>, config: FanoutConfig) -> Self {
        Self {
            broker,
            config,
            origin: Uuid::new_v4(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Allocate the sequence number for the next publish. Unique per bridge.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn topic(&self, channel_id: ChannelId) -> String {
        format!("{}:{}", self.config.topic_prefix, channel_id)
    }

    /// Spawn the subscription task for a channel. Does not block, so the
    /// connection manager calls it while holding its registry lock.
    pub fn open_subscription(
        &self,
        channel_id: ChannelId,
        generation: u64,
        sink: Weak<dyn ChannelSink>,
    ) -> SubscriptionHandle {
        let cancel = CancellationToken::new();
        let (live_tx, live) = watch::channel(false);

        let task = tokio::spawn(run_subscription(SubscriptionTask {
            broker: Arc::clone(&self.broker),
            topic: self.topic(channel_id),
            channel_id,
            generation,
            sink,
            cancel: cancel.clone(),
            live: live_tx,
            origin: self.origin,
            backoff: self.config.backoff.clone(),
        }));

        tracing::debug!(channel_id = channel_id, generation = generation, "Channel subscription opened");

        SubscriptionHandle {
            channel_id,
            generation,
            cancel,
            live,
            task: Some(task),
        }
    }

    /// Serialize once and publish to the channel's topic, retrying with
    /// backoff. `sequence` comes from [`next_sequence`](Self::next_sequence)
    /// and is handed back to this process's sink when the event returns.
    /// Returns the number of broker subscribers reached.
    pub async fn publish(
        &self,
        channel_id: ChannelId,
        event: &DeliveryEvent,
        sequence: u64,
    ) -> Result<usize, BrokerError> {
        let topic = self.topic(channel_id);
        let payload = serde_json::to_string(&OutboundPayload {
            event,
            origin: PayloadOrigin {
                process: self.origin,
                sequence,
            },
        })?;

        retry_with_backoff(&self.config.backoff, self.config.publish_attempts, |attempt| {
            let broker = Arc::clone(&self.broker);
            let topic = topic.clone();
            let payload = payload.clone();
            async move {
                if attempt > 1 {
                    tracing::debug!(topic = %topic, attempt = attempt, "Retrying publish");
                }
                broker.publish(&topic, &payload).await
            }
        })
        .await
    }
}

struct SubscriptionTask {
    broker: Arc<dyn Broker>,
    topic: String,
    channel_id: ChannelId,
    generation: u64,
    sink: Weak<dyn ChannelSink>,
    cancel: CancellationToken,
    live: watch::Sender<bool>,
    origin: Uuid,
    backoff: BackoffConfig,
}

enum StreamEnd {
    Cancelled,
    SinkGone,
    Closed,
}

async fn run_subscription(task: SubscriptionTask) {
    let mut backoff = ExponentialBackoff::with_config(task.backoff.clone());

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => break,
            result = task.broker.subscribe(&task.topic) => result,
        };

        match subscribed {
            Ok(stream) => {
                backoff.reset();
                task.live.send_replace(true);
                BrokerMetrics::subscription_opened();
                tracing::info!(
                    topic = %task.topic,
                    generation = task.generation,
                    "Broker subscription live"
                );

                let end = pump(&task, stream).await;

                task.live.send_replace(false);
                BrokerMetrics::subscription_closed();

                match end {
                    StreamEnd::Cancelled | StreamEnd::SinkGone => break,
                    StreamEnd::Closed => {
                        tracing::warn!(topic = %task.topic, "Broker stream ended, resubscribing");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    topic = %task.topic,
                    attempt = backoff.attempt() + 1,
                    error = %e,
                    "Broker subscribe failed"
                );
            }
        }

        BrokerMetrics::record_resubscribe();
        let delay = backoff.next_delay();
        tokio::select! {
            biased;
            _ = task.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(topic = %task.topic, generation = task.generation, "Subscription task stopped");
}

async fn pump(task: &SubscriptionTask, mut stream: PayloadStream) -> StreamEnd {
    loop {
        let payload = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => return StreamEnd::Cancelled,
            next = stream.next() => match next {
                Some(payload) => payload,
                None => return StreamEnd::Closed,
            },
        };

        BrokerMetrics::record_received();

        let InboundPayload { event, origin } = match serde_json::from_str(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                BrokerMetrics::record_decode_error();
                tracing::warn!(topic = %task.topic, error = %e, "Undecodable broker payload skipped");
                continue;
            }
        };
        if event.channel_id != task.channel_id {
            BrokerMetrics::record_decode_error();
            tracing::warn!(
                topic = %task.topic,
                event_channel = event.channel_id,
                "Broker payload for another channel skipped"
            );
            continue;
        }

        let Some(sink) = task.sink.upgrade() else {
            return StreamEnd::SinkGone;
        };
        let own_sequence = origin
            .filter(|origin| origin.process == task.origin)
            .map(|origin| origin.sequence);
        sink.deliver(task.channel_id, task.generation, Arc::new(event), own_sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(ChannelId, u64, Arc<DeliveryEvent>, Option<u64>)>>,
    }

    impl ChannelSink for RecordingSink {
        fn deliver(
            &self,
            channel_id: ChannelId,
            generation: u64,
            event: Arc<DeliveryEvent>,
            own_sequence: Option<u64>,
        ) {
            self.events.lock().push((channel_id, generation, event, own_sequence));
        }
    }

    fn fast_config() -> FanoutConfig {
        FanoutConfig {
            topic_prefix: "chat".to_string(),
            publish_attempts: 2,
            backoff: BackoffConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
            live_wait: Duration::from_millis(50),
        }
    }

    async fn wait_live(handle: &SubscriptionHandle) {
        for _ in 0..200 {
            if handle.is_live() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscription never became live");
    }

    async fn wait_for_events(sink: &RecordingSink, count: usize) {
        for _ in 0..200 {
            if sink.events.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} events", count);
    }

    #[test]
    fn test_topic_naming() {
        let bridge = FanoutBridge::new(Arc::new(MemoryBroker::new()), FanoutConfig::default());
        assert_eq!(bridge.topic(7), "chat:7");
    }

    #[tokio::test]
    async fn test_published_event_reaches_sink_with_generation() {
        let broker = Arc::new(MemoryBroker::new());
        let bridge = FanoutBridge::new(broker, fast_config());
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn ChannelSink> = Arc::downgrade(&sink) as Weak<dyn ChannelSink>;

        let handle = bridge.open_subscription(7, 3, weak);
        wait_live(&handle).await;

        let sequence = bridge.next_sequence();
        let reached = bridge
            .publish(7, &DeliveryEvent::notification(7, "hello"), sequence)
            .await
            .unwrap();
        assert_eq!(reached, 1);

        wait_for_events(&sink, 1).await;
        let events = sink.events.lock();
        assert_eq!(events[0].0, 7);
        assert_eq!(events[0].1, 3);
        assert_eq!(events[0].2.data, serde_json::json!("hello"));
        assert_eq!(events[0].3, Some(sequence));
    }

    #[tokio::test]
    async fn test_payloads_from_elsewhere_carry_no_own_sequence() {
        let broker = Arc::new(MemoryBroker::new());
        let local = FanoutBridge::new(Arc::clone(&broker) as Arc<dyn Broker>, fast_config());
        let remote = FanoutBridge::new(Arc::clone(&broker) as Arc<dyn Broker>, fast_config());
        let sink = Arc::new(RecordingSink::default());

        let handle = local.open_subscription(7, 1, Arc::downgrade(&sink) as Weak<dyn ChannelSink>);
        wait_live(&handle).await;

        remote
            .publish(7, &DeliveryEvent::notification(7, "remote"), remote.next_sequence())
            .await
            .unwrap();
        let plain = DeliveryEvent::notification(7, "untagged").to_json().unwrap();
        broker.publish("chat:7", &plain).await.unwrap();

        wait_for_events(&sink, 2).await;
        let events = sink.events.lock();
        assert_eq!(events[0].2.data, serde_json::json!("remote"));
        assert_eq!(events[0].3, None);
        assert_eq!(events[1].2.data, serde_json::json!("untagged"));
        assert_eq!(events[1].3, None);
    }

    #[tokio::test]
    async fn test_live_signal_follows_subscription() {
        let bridge = FanoutBridge::new(Arc::new(MemoryBroker::new()), fast_config());
        let sink = Arc::new(RecordingSink::default());
        let handle = bridge.open_subscription(7, 1, Arc::downgrade(&sink) as Weak<dyn ChannelSink>);

        let mut live = handle.live_signal();
        tokio::time::timeout(Duration::from_secs(2), live.wait_for(|live| *live))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_live());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        let bridge = FanoutBridge::new(Arc::clone(&broker) as Arc<dyn Broker>, fast_config());
        let sink = Arc::new(RecordingSink::default());

        let handle = bridge.open_subscription(7, 1, Arc::downgrade(&sink) as Weak<dyn ChannelSink>);
        wait_live(&handle).await;

        broker.publish("chat:7", "not json").await.unwrap();
        bridge
            .publish(7, &DeliveryEvent::notification(7, "after"), bridge.next_sequence())
            .await
            .unwrap();

        wait_for_events(&sink, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_broker_subscription() {
        let broker = Arc::new(MemoryBroker::new());
        let bridge = FanoutBridge::new(Arc::clone(&broker) as Arc<dyn Broker>, fast_config());
        let sink = Arc::new(RecordingSink::default());

        let handle = bridge.open_subscription(7, 1, Arc::downgrade(&sink) as Weak<dyn ChannelSink>);
        wait_live(&handle).await;
        assert_eq!(broker.subscriber_count("chat:7"), 1);

        handle.shutdown().await;
        assert_eq!(broker.subscriber_count("chat:7"), 0);
    }
}
