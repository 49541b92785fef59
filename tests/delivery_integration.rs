//! Cross-process delivery: several connection managers sharing one broker
//! and one presence set, as separate server processes would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use chat_delivery_service::broker::{Broker, BrokerError, MemoryBroker, PayloadStream};
use chat_delivery_service::chat::{Message, MessageStatus};
use chat_delivery_service::connection_manager::{
    ConnectionManager, Outbound, PublishOutcome, Session,
};
use chat_delivery_service::fanout::{FanoutBridge, FanoutConfig};
use chat_delivery_service::presence::{MemoryPresenceStore, PresenceTracker, PresenceWriterConfig};
use chat_delivery_service::redis::BackoffConfig;
use chat_delivery_service::websocket::{DeliveryEvent, EventKind};

fn fast_fanout() -> FanoutConfig {
    FanoutConfig {
        publish_attempts: 2,
        backoff: BackoffConfig::with_delays(1, 10),
        live_wait: Duration::from_millis(50),
        ..FanoutConfig::default()
    }
}

fn process(broker: Arc<dyn Broker>, presence_store: MemoryPresenceStore) -> Arc<ConnectionManager> {
    let bridge = Arc::new(FanoutBridge::new(broker, fast_fanout()));
    let presence = PresenceTracker::new(Arc::new(presence_store), PresenceWriterConfig::default());
    ConnectionManager::new(bridge, presence)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next event on a session's queue, skipping pings
async fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> Arc<DeliveryEvent> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Outbound::Event(event))) => return event,
            Ok(Some(Outbound::Ping)) => continue,
            Ok(None) => panic!("session queue closed"),
            Err(_) => panic!("no event received"),
        }
    }
}

async fn assert_silent(rx: &mut mpsc::Receiver<Outbound>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected event on session queue");
}

fn chat_message(id: i64, content: &str, sender_id: i64, channel_id: i64) -> Message {
    Message {
        id,
        content: content.to_string(),
        sender_id,
        channel_id,
        status: MessageStatus::Sent,
        created_at: Utc::now(),
    }
}

/// A broker that is down for good
struct FailingBroker;

#[async_trait]
impl Broker for FailingBroker {
    fn backend_name(&self) -> &'static str {
        "failing"
    }

    async fn publish(&self, _topic: &str, _payload: &str) -> Result<usize, BrokerError> {
        Err(BrokerError::Unavailable("broker down".to_string()))
    }

    async fn subscribe(&self, _topic: &str) -> Result<PayloadStream, BrokerError> {
        Err(BrokerError::Unavailable("broker down".to_string()))
    }
}

/// Holds every subscribe back until a publish has started, so the
/// subscription comes up while that publish is on its way to the broker
struct GatedBroker {
    inner: MemoryBroker,
    publishing: watch::Sender<bool>,
    reached: AtomicUsize,
}

impl GatedBroker {
    fn new() -> Self {
        Self {
            inner: MemoryBroker::new(),
            publishing: watch::channel(false).0,
            reached: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Broker for GatedBroker {
    fn backend_name(&self) -> &'static str {
        "gated"
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, BrokerError> {
        self.publishing.send_replace(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reached = self.inner.publish(topic, payload).await?;
        self.reached.fetch_add(reached, Ordering::SeqCst);
        Ok(reached)
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BrokerError> {
        let mut publishing = self.publishing.subscribe();
        publishing
            .wait_for(|started| *started)
            .await
            .map_err(|_| BrokerError::Unavailable("gate dropped".to_string()))?;
        self.inner.subscribe(topic).await
    }
}

#[tokio::test]
async fn test_message_reaches_session_on_other_process() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let presence_a = MemoryPresenceStore::new("process-1");
    let presence_b = presence_a.with_peer("process-2");
    let p1 = process(Arc::clone(&broker), presence_a);
    let p2 = process(Arc::clone(&broker), presence_b);

    let (alice, mut alice_rx) = Session::new(1, 7, 16);
    let (bob, mut bob_rx) = Session::new(2, 7, 16);
    p1.connect(alice).await.unwrap();
    p2.connect(bob).await.unwrap();
    assert_eq!(next_event(&mut alice_rx).await.kind, EventKind::ConnectionStatus);
    assert_eq!(next_event(&mut bob_rx).await.kind, EventKind::ConnectionStatus);

    wait_until("both subscriptions live", || {
        p1.subscription_live(7) && p2.subscription_live(7)
    })
    .await;

    let message = chat_message(10, "hi", 1, 7);
    let outcome = p1.publish(7, DeliveryEvent::message(&message)).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Broker);

    let received = next_event(&mut bob_rx).await;
    assert_eq!(received.kind, EventKind::Message);
    assert_eq!(received.data["content"], "hi");
    assert_eq!(received.data["sender_id"], 1);
    assert_eq!(received.data["channel_id"], 7);
    assert_eq!(received.data["status"], "sent");

    // The origin gets its own copy back through the broker, exactly once
    let echoed = next_event(&mut alice_rx).await;
    assert_eq!(echoed.data["id"], 10);
    assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn test_first_publish_on_new_channel_waits_for_subscription() {
    let manager = process(Arc::new(MemoryBroker::new()), MemoryPresenceStore::new("process-1"));

    let (session, mut rx) = Session::new(1, 7, 8);
    manager.connect(session).await.unwrap();
    next_event(&mut rx).await;

    let outcome = manager
        .publish(7, DeliveryEvent::notification(7, "alice joined the chat"))
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Broker);
    assert_eq!(next_event(&mut rx).await.data, "alice joined the chat");
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_local_echo_is_not_repeated_when_subscription_catches_up() {
    let broker = Arc::new(GatedBroker::new());
    let manager = process(broker.clone(), MemoryPresenceStore::new("process-1"));

    let (session, mut rx) = Session::new(1, 7, 8);
    manager.connect(session).await.unwrap();
    next_event(&mut rx).await;

    let outcome = manager
        .publish(7, DeliveryEvent::notification(7, "alice joined the chat"))
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::BrokerWithLocalEcho);
    assert!(manager.subscription_live(7));
    // The broker did hand the event back to this process's subscription
    assert_eq!(broker.reached.load(Ordering::SeqCst), 1);

    assert_eq!(next_event(&mut rx).await.data, "alice joined the chat");
    assert_silent(&mut rx).await;

    // Once live, later events take the round trip only
    let outcome = manager
        .publish(7, DeliveryEvent::notification(7, "second"))
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Broker);
    assert_eq!(next_event(&mut rx).await.data, "second");
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_presence_is_shared_across_processes() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let presence_a = MemoryPresenceStore::new("process-1");
    let presence_b = presence_a.with_peer("process-2");
    let p1 = process(Arc::clone(&broker), presence_a);
    let p2 = process(Arc::clone(&broker), presence_b);

    let (on_p1, _rx1) = Session::new(1, 7, 8);
    let (on_p2, _rx2) = Session::new(1, 8, 8);
    p1.connect(on_p1).await.unwrap();
    p2.connect(on_p2).await.unwrap();
    assert!(p2.presence().is_online(1).await.unwrap());

    // Still held by process 2
    assert!(p1.disconnect(1, 7).await);
    assert!(!p1.is_present(1));
    assert!(p1.presence().is_online(1).await.unwrap());

    assert!(p2.disconnect(1, 8).await);
    assert!(!p1.presence().is_online(1).await.unwrap());
    assert!(p1.presence().list_online().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_subscription_follows_local_subscribers() {
    let broker = Arc::new(MemoryBroker::new());
    let manager = process(broker.clone(), MemoryPresenceStore::new("process-1"));

    let (a, _rx_a) = Session::new(1, 7, 8);
    let (b, _rx_b) = Session::new(2, 7, 8);
    manager.connect(a).await.unwrap();
    manager.connect(b).await.unwrap();
    assert!(manager.has_broker_subscription(7));
    wait_until("broker subscribed", || broker.subscriber_count("chat:7") == 1).await;

    manager.disconnect(1, 7).await;
    assert!(manager.has_broker_subscription(7));

    manager.disconnect(2, 7).await;
    assert!(!manager.has_broker_subscription(7));
    assert!(!manager.is_present(1));
    assert!(!manager.is_present(2));
    wait_until("broker unsubscribed", || broker.subscriber_count("chat:7") == 0).await;

    // Disconnecting again changes nothing
    assert!(!manager.disconnect(2, 7).await);
}

#[tokio::test]
async fn test_broadcast_reaches_exactly_the_snapshot() {
    let manager = process(Arc::new(MemoryBroker::new()), MemoryPresenceStore::new("process-1"));

    let (a, mut rx_a) = Session::new(1, 7, 8);
    let (b, mut rx_b) = Session::new(2, 7, 8);
    let (other, mut rx_other) = Session::new(3, 8, 8);
    manager.connect(a).await.unwrap();
    manager.connect(b).await.unwrap();
    manager.connect(other).await.unwrap();
    next_event(&mut rx_a).await;
    next_event(&mut rx_b).await;
    next_event(&mut rx_other).await;

    let report = manager.broadcast(7, Arc::new(DeliveryEvent::notification(7, "hello")));
    assert_eq!(report.delivered, 2);
    assert!(report.failed_users.is_empty());

    assert_eq!(next_event(&mut rx_a).await.data, "hello");
    assert_eq!(next_event(&mut rx_b).await.data, "hello");
    assert_silent(&mut rx_other).await;
}

#[tokio::test]
async fn test_broken_transport_disconnects_session() {
    let manager = process(Arc::new(MemoryBroker::new()), MemoryPresenceStore::new("process-1"));

    let (session, rx) = Session::new(1, 7, 8);
    manager.connect(session).await.unwrap();
    drop(rx);

    let delivered = manager.send(1, 7, Arc::new(DeliveryEvent::notification(7, "x")));
    assert!(!delivered);
    assert!(!manager.is_in_channel(1, 7));
    assert!(!manager.has_broker_subscription(7));
    wait_until("presence cleared", || !manager.is_present(1)).await;
}

#[tokio::test]
async fn test_broker_outage_degrades_to_local_delivery() {
    let manager = process(Arc::new(FailingBroker), MemoryPresenceStore::new("process-1"));

    let (session, mut rx) = Session::new(1, 7, 8);
    manager.connect(session).await.unwrap();
    next_event(&mut rx).await;
    assert!(!manager.subscription_live(7));

    let message = chat_message(1, "still here", 1, 7);
    let outcome = manager.publish(7, DeliveryEvent::message(&message)).await.unwrap();
    assert_eq!(outcome, PublishOutcome::LocalOnly);
    assert_eq!(next_event(&mut rx).await.data["content"], "still here");

    // Nobody local to serve: the failure surfaces
    let result = manager.publish(9, DeliveryEvent::notification(9, "lost")).await;
    assert!(result.is_err());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let broker = Arc::new(MemoryBroker::new());
    let manager = process(broker.clone(), MemoryPresenceStore::new("process-1"));

    for user in 1..=3 {
        let (session, _rx) = Session::new(user, 7, 8);
        manager.connect(session).await.unwrap();
    }
    wait_until("subscription live", || manager.subscription_live(7)).await;

    manager.shutdown().await;

    let stats = manager.stats();
    assert_eq!(stats.total_sessions, 0);
    assert_eq!(stats.broker_subscriptions, 0);
    assert!(manager.presence().list_online().await.unwrap().is_empty());
    assert_eq!(broker.subscriber_count("chat:7"), 0);
}
