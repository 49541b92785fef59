//! The connection manager: the only owner of sessions.
//!
//! All registry and subscription mutations happen inside one short
//! `parking_lot::Mutex` critical section that never spans an `.await`.
//! Broker subscriptions are opened and cancelled from inside that section
//! (both are non-blocking), and presence transitions are enqueued there in
//! the same order; the I/O itself happens outside.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::chat::{ChannelId, UserId};
use crate::fanout::{ChannelSink, FanoutBridge, SubscriptionHandle};
use crate::broker::BrokerError;
use crate::metrics::{BrokerMetrics, DeliveryMetrics, SessionMetrics};
use crate::presence::{PresenceAck, PresenceTracker, PresenceUpdate};
use crate::websocket::DeliveryEvent;

use super::registry::{Removal, SessionRegistry};
use super::session::{ConnectError, SendFailure, Session};
use super::stats::{BroadcastReport, ConnectionStats};

/// How a published event reached local sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Published; local sessions get it through the broker round trip
    Broker,
    /// Published, and delivered locally because this process's
    /// subscription was not live in time. The broker copy, if it comes
    /// back, is skipped
    BrokerWithLocalEcho,
    /// Broker publish failed; only local sessions received the event
    LocalOnly,
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Broker => "broker",
            PublishOutcome::BrokerWithLocalEcho => "local_echo",
            PublishOutcome::LocalOnly => "local_only",
        }
    }
}

struct ManagerState {
    registry: SessionRegistry,
    /// Present exactly for channels with at least one local subscriber
    subscriptions: HashMap<ChannelId, SubscriptionHandle>,
    /// Own publishes already delivered locally, by channel. Their copies
    /// returning through the subscription are dropped.
    delivered_locally: HashMap<ChannelId, HashSet<u64>>,
    next_generation: u64,
    shutting_down: bool,
}

pub struct ConnectionManager {
    state: Mutex<ManagerState>,
    bridge: Arc<FanoutBridge>,
    presence: Arc<PresenceTracker>,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(bridge: Arc<FanoutBridge>, presence: Arc<PresenceTracker>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(ManagerState {
                registry: SessionRegistry::new(),
                subscriptions: HashMap::new(),
                delivered_locally: HashMap::new(),
                next_generation: 1,
                shutting_down: false,
            }),
            bridge,
            presence,
            weak_self: weak_self.clone(),
        })
    }

    pub fn bridge(&self) -> &Arc<FanoutBridge> {
        &self.bridge
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Register a session for its (user, channel) pair.
    ///
    /// Supersedes and closes an older session for the same pair, starts the
    /// channel's broker subscription if this is its first local subscriber,
    /// marks the user present if this is their first local session, and
    /// finally sends `connection_status: connected` to the new session only.
    #[tracing::instrument(
        name = "manager.connect",
        skip(self, session),
        fields(session_id = %session.id, user_id = session.user_id, channel_id = session.channel_id)
    )]
    pub async fn connect(&self, session: Arc<Session>) -> Result<(), ConnectError> {
        if !session.is_open() {
            return Err(ConnectError::AlreadyClosing);
        }

        let (superseded, presence_ack) = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Err(ConnectError::ShuttingDown);
            }

            let registration = state.registry.insert(Arc::clone(&session));
            if registration.channel_opened {
                self.open_channel(&mut state, session.channel_id);
            }
            let ack = registration
                .user_first_session
                .then(|| self.presence.enqueue(PresenceUpdate::online(session.user_id)));
            update_gauges(&state);
            (registration.superseded, ack)
        };

        if let Some(old) = superseded {
            old.close();
            SessionMetrics::record_superseded();
            tracing::info!(superseded_session = %old.id, "Older session for the same user and channel replaced");
        }

        if let Some(ack) = presence_ack {
            if !ack.wait().await {
                tracing::warn!("Presence not recorded for connecting user");
            }
        }

        let status = Arc::new(DeliveryEvent::connection_status(session.channel_id, "connected"));
        if let Err(failure) = session.try_deliver(status) {
            tracing::warn!(?failure, "Session closed before connection status was sent");
            self.disconnect_session(&session).await;
            return Err(ConnectError::AlreadyClosing);
        }

        tracing::info!("Session connected");
        Ok(())
    }

    fn open_channel(&self, state: &mut ManagerState, channel_id: ChannelId) {
        let generation = state.next_generation;
        state.next_generation += 1;

        let sink: Weak<dyn ChannelSink> = self.weak_self.clone();
        let handle = self.bridge.open_subscription(channel_id, generation, sink);
        state.delivered_locally.remove(&channel_id);
        if let Some(stale) = state.subscriptions.insert(channel_id, handle) {
            tracing::warn!(
                channel_id = channel_id,
                generation = stale.generation(),
                "Replacing leftover channel subscription"
            );
        }
    }

    /// Remove the session registered for the pair, if any. Idempotent:
    /// returns `false` when there was nothing to remove.
    #[tracing::instrument(name = "manager.disconnect", skip(self))]
    pub async fn disconnect(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removal = state.registry.remove(user_id, channel_id);
            self.apply_removal(&mut state, removal)
        };
        self.finish_removal(removed).await
    }

    /// Remove `session` only if it is still the registered session for its
    /// pair. A superseded session's cleanup never removes its replacement.
    #[tracing::instrument(
        name = "manager.disconnect_session",
        skip(self, session),
        fields(session_id = %session.id, user_id = session.user_id, channel_id = session.channel_id)
    )]
    pub async fn disconnect_session(&self, session: &Session) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removal = state.registry.remove_if(session);
            self.apply_removal(&mut state, removal)
        };
        if removed.is_none() {
            // Superseded or already removed; make sure it is closed anyway
            session.close();
        }
        self.finish_removal(removed).await
    }

    /// Evict a session from the heartbeat path.
    pub async fn evict(&self, session: &Session) -> bool {
        self.disconnect_session(session).await
    }

    fn apply_removal(
        &self,
        state: &mut ManagerState,
        removal: Option<Removal>,
    ) -> Option<(Arc<Session>, Option<PresenceAck>)> {
        let removal = removal?;
        let session = removal.session;

        if removal.channel_emptied {
            state.delivered_locally.remove(&session.channel_id);
            if let Some(handle) = state.subscriptions.remove(&session.channel_id) {
                handle.cancel();
                tracing::debug!(
                    channel_id = session.channel_id,
                    generation = handle.generation(),
                    "Channel subscription torn down"
                );
            }
        }

        let ack = removal
            .user_last_session
            .then(|| self.presence.enqueue(PresenceUpdate::offline(session.user_id)));
        update_gauges(state);
        Some((session, ack))
    }

    async fn finish_removal(&self, removed: Option<(Arc<Session>, Option<PresenceAck>)>) -> bool {
        let Some((session, ack)) = removed else {
            return false;
        };

        session.close();
        if let Some(ack) = ack {
            if !ack.wait().await {
                tracing::warn!(user_id = session.user_id, "Presence not cleared for disconnected user");
            }
        }
        tracing::info!(
            session_id = %session.id,
            user_id = session.user_id,
            channel_id = session.channel_id,
            "Session disconnected"
        );
        true
    }

    /// Remove a failed session without waiting for its presence update.
    /// Used on the synchronous delivery path so broker tasks never stall.
    fn drop_failed(&self, session: &Session, failure: SendFailure) {
        match failure {
            SendFailure::Closed => DeliveryMetrics::record_closed(),
            SendFailure::Full => DeliveryMetrics::record_full(),
        }

        let removed = {
            let mut state = self.state.lock();
            let removal = state.registry.remove_if(session);
            self.apply_removal(&mut state, removal)
        };
        session.close();

        if removed.is_some() {
            tracing::info!(
                session_id = %session.id,
                user_id = session.user_id,
                channel_id = session.channel_id,
                ?failure,
                "Session dropped after failed delivery"
            );
        }
    }

    /// Best-effort delivery to one session. A closed or full queue
    /// disconnects the session and returns `false`.
    pub fn send(&self, user_id: UserId, channel_id: ChannelId, event: Arc<DeliveryEvent>) -> bool {
        let session = self.state.lock().registry.get(user_id, channel_id);
        let Some(session) = session else {
            return false;
        };

        match session.try_deliver(event) {
            Ok(()) => {
                DeliveryMetrics::record_delivered(1);
                true
            }
            Err(failure) => {
                self.drop_failed(&session, failure);
                false
            }
        }
    }

    /// Deliver to every session registered in the channel at call time.
    pub fn broadcast(&self, channel_id: ChannelId, event: Arc<DeliveryEvent>) -> BroadcastReport {
        let snapshot = self.state.lock().registry.channel_snapshot(channel_id);
        self.deliver_to(snapshot, event)
    }

    fn deliver_to(&self, sessions: Vec<Arc<Session>>, event: Arc<DeliveryEvent>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for session in sessions {
            match session.try_deliver(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    self.drop_failed(&session, failure);
                    report.failed_users.push(session.user_id);
                }
            }
        }

        DeliveryMetrics::record_delivered(report.delivered as u64);
        report
    }

    /// Publish an event to the channel's topic.
    ///
    /// Local sessions normally receive it back through this process's own
    /// subscription. A subscription that was just opened is given
    /// `live_wait` to come up first. If it still is not live, or the publish
    /// fails after retries, local sessions are served directly and the copy
    /// coming back from the broker is skipped, so every local session sees
    /// the event once. The error is only returned when the broker failed and
    /// nobody local could be served.
    #[tracing::instrument(name = "manager.publish", skip(self, event), fields(kind = ?event.kind))]
    pub async fn publish(
        &self,
        channel_id: ChannelId,
        event: DeliveryEvent,
    ) -> Result<PublishOutcome, BrokerError> {
        let event = Arc::new(event);

        let pending = {
            let state = self.state.lock();
            state
                .subscriptions
                .get(&channel_id)
                .filter(|handle| !handle.is_live())
                .map(|handle| handle.live_signal())
        };
        if let Some(mut live) = pending {
            let wait = self.bridge.config().live_wait;
            if tokio::time::timeout(wait, live.wait_for(|live| *live)).await.is_err() {
                tracing::debug!(channel_id = channel_id, "Subscription not live in time");
            }
        }

        let sequence = self.bridge.next_sequence();
        let echoed = self.deliver_locally_unless_live(channel_id, sequence, &event);

        let outcome = match self.bridge.publish(channel_id, &event, sequence).await {
            Ok(_) if echoed => PublishOutcome::BrokerWithLocalEcho,
            Ok(_) => PublishOutcome::Broker,
            Err(e) => {
                BrokerMetrics::record_publish_failure();
                if !echoed && !self.deliver_locally(channel_id, sequence, &event) {
                    tracing::error!(error = %e, "Publish failed with no local subscribers");
                    return Err(e);
                }
                tracing::warn!(error = %e, "Publish failed, delivering to local sessions only");
                PublishOutcome::LocalOnly
            }
        };

        DeliveryMetrics::record_published(outcome.as_str());
        Ok(outcome)
    }

    fn deliver_locally_unless_live(
        &self,
        channel_id: ChannelId,
        sequence: u64,
        event: &Arc<DeliveryEvent>,
    ) -> bool {
        let live = self
            .state
            .lock()
            .subscriptions
            .get(&channel_id)
            .map(|handle| handle.is_live())
            .unwrap_or(false);
        !live && self.deliver_locally(channel_id, sequence, event)
    }

    /// Serve local subscribers directly and remember `sequence` so the
    /// broker copy is skipped. Returns `false` when nobody local is subscribed.
    fn deliver_locally(
        &self,
        channel_id: ChannelId,
        sequence: u64,
        event: &Arc<DeliveryEvent>,
    ) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            let snapshot = state.registry.channel_snapshot(channel_id);
            if snapshot.is_empty() {
                return false;
            }
            if state.subscriptions.contains_key(&channel_id) {
                state
                    .delivered_locally
                    .entry(channel_id)
                    .or_default()
                    .insert(sequence);
            }
            snapshot
        };
        self.deliver_to(snapshot, Arc::clone(event));
        true
    }

    /// Whether the user has any session on this process.
    pub fn is_present(&self, user_id: UserId) -> bool {
        self.state.lock().registry.has_user(user_id)
    }

    pub fn is_in_channel(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        self.state.lock().registry.contains(user_id, channel_id)
    }

    pub fn channel_subscriber_count(&self, channel_id: ChannelId) -> usize {
        self.state.lock().registry.channel_subscriber_count(channel_id)
    }

    pub fn has_broker_subscription(&self, channel_id: ChannelId) -> bool {
        self.state.lock().subscriptions.contains_key(&channel_id)
    }

    pub fn subscription_live(&self, channel_id: ChannelId) -> bool {
        self.state
            .lock()
            .subscriptions
            .get(&channel_id)
            .map(|handle| handle.is_live())
            .unwrap_or(false)
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().registry.all_sessions()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.state.lock();
        ConnectionStats {
            total_sessions: state.registry.session_count(),
            unique_users: state.registry.user_count(),
            channels: state.registry.channel_counts(),
            broker_subscriptions: state.subscriptions.len(),
            live_subscriptions: state.subscriptions.values().filter(|h| h.is_live()).count(),
        }
    }

    /// Refuse new connects, close every session, release every broker
    /// subscription and clear this process's presence entries.
    pub async fn shutdown(&self) {
        let (sessions, subscriptions, acks) = {
            let mut state = self.state.lock();
            state.shutting_down = true;

            let acks: Vec<PresenceAck> = state
                .registry
                .users()
                .into_iter()
                .map(|user_id| self.presence.enqueue(PresenceUpdate::offline(user_id)))
                .collect();
            let sessions = state.registry.drain();
            state.delivered_locally.clear();
            let subscriptions: Vec<SubscriptionHandle> =
                state.subscriptions.drain().map(|(_, handle)| handle).collect();
            update_gauges(&state);
            (sessions, subscriptions, acks)
        };

        tracing::info!(
            sessions = sessions.len(),
            subscriptions = subscriptions.len(),
            "Connection manager shutting down"
        );

        for session in &sessions {
            session.close();
        }
        for handle in subscriptions {
            handle.shutdown().await;
        }
        for ack in acks {
            ack.wait().await;
        }
    }
}

impl ChannelSink for ConnectionManager {
    fn deliver(
        &self,
        channel_id: ChannelId,
        generation: u64,
        event: Arc<DeliveryEvent>,
        own_sequence: Option<u64>,
    ) {
        let snapshot = {
            let mut state = self.state.lock();
            let current = state
                .subscriptions
                .get(&channel_id)
                .map(|handle| handle.generation());
            if current != Some(generation) {
                tracing::debug!(
                    channel_id = channel_id,
                    generation = generation,
                    "Event from a superseded subscription dropped"
                );
                return;
            }

            if let Some(sequence) = own_sequence {
                let already_delivered = state
                    .delivered_locally
                    .get_mut(&channel_id)
                    .map(|sequences| sequences.remove(&sequence))
                    .unwrap_or(false);
                if already_delivered {
                    tracing::debug!(
                        channel_id = channel_id,
                        sequence = sequence,
                        "Broker copy of a locally delivered event skipped"
                    );
                    return;
                }
            }

            state.registry.channel_snapshot(channel_id)
        };
        self.deliver_to(snapshot, event);
    }
}

fn update_gauges(state: &ManagerState) {
    SessionMetrics::set_counts(
        state.registry.session_count(),
        state.registry.user_count(),
        state.registry.channel_count(),
    );
}
