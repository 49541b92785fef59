//! A live (user, channel) connection as seen by the connection manager.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::chat::{ChannelId, UserId};
use crate::websocket::DeliveryEvent;

/// Item on a session's outbound queue, drained by the socket writer
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<DeliveryEvent>),
    Ping,
}

/// Why a non-blocking enqueue was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The session is closing or its writer is gone
    Closed,
    /// The outbound queue is at capacity
    Full,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("session is already closing")]
    AlreadyClosing,

    #[error("connection manager is shutting down")]
    ShuttingDown,
}

pub struct Session {
    pub id: Uuid,
    pub user_id: UserId,
    pub channel_id: ChannelId,
    sender: mpsc::Sender<Outbound>,
    open: AtomicBool,
    closed: CancellationToken,
    pub connected_at: DateTime<Utc>,
    /// Unix seconds, updated lock-free by the reader
    last_activity: AtomicI64,
}

impl Session {
    /// Create a session with a bounded outbound queue of `capacity` items.
    /// The receiver belongs to whoever writes to the socket.
    pub fn new(
        user_id: UserId,
        channel_id: ChannelId,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let now = Utc::now();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            channel_id,
            sender,
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
        });
        (session, receiver)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Enqueue without waiting. Never blocks the caller.
    pub fn try_deliver(&self, event: Arc<DeliveryEvent>) -> Result<(), SendFailure> {
        self.try_enqueue(Outbound::Event(event))
    }

    pub fn try_ping(&self) -> Result<(), SendFailure> {
        self.try_enqueue(Outbound::Ping)
    }

    fn try_enqueue(&self, item: Outbound) -> Result<(), SendFailure> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SendFailure::Closed);
        }
        match self.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendFailure::Full),
            Err(TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Mark the session closed and wake everything waiting on
    /// [`Session::closed`]. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        let first = self.open.swap(false, Ordering::AcqRel);
        self.closed.cancel();
        first
    }

    /// Resolves once the session has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    /// Whether no activity was seen for longer than `timeout_secs`.
    pub fn is_stale(&self, timeout_secs: u64) -> bool {
        let idle = Utc::now().timestamp() - self.last_activity.load(Ordering::Relaxed);
        idle > timeout_secs as i64
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("channel_id", &self.channel_id)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Arc<DeliveryEvent> {
        Arc::new(DeliveryEvent::notification(7, "hello"))
    }

    #[tokio::test]
    async fn test_deliver_enqueues_shared_event() {
        let (session, mut rx) = Session::new(1, 7, 4);
        let shared = event();

        session.try_deliver(Arc::clone(&shared)).unwrap();

        match rx.recv().await {
            Some(Outbound::Event(received)) => assert!(Arc::ptr_eq(&received, &shared)),
            other => panic!("unexpected outbound item: {:?}", other),
        }
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (session, _rx) = Session::new(1, 7, 1);

        session.try_deliver(event()).unwrap();
        assert_eq!(session.try_deliver(event()), Err(SendFailure::Full));
    }

    #[test]
    fn test_dropped_receiver_is_closed() {
        let (session, rx) = Session::new(1, 7, 4);
        drop(rx);

        assert!(!session.is_open());
        assert_eq!(session.try_ping(), Err(SendFailure::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_waiters() {
        let (session, _rx) = Session::new(1, 7, 4);

        assert!(session.close());
        assert!(!session.close());
        session.closed().await;

        assert!(!session.is_open());
        assert_eq!(session.try_deliver(event()), Err(SendFailure::Closed));
    }

    #[test]
    fn test_fresh_session_is_not_stale() {
        let (session, _rx) = Session::new(1, 7, 4);
        session.touch();
        assert!(!session.is_stale(60));
    }
}
