//! Presence tracker with a single ordered writer.
//!
//! The connection manager decides presence transitions while it holds its
//! registry lock and enqueues them here without blocking. One writer task
//! applies them to the shared store in exactly that order, retrying broker
//! failures with backoff, so a connect and a disconnect racing for the same
//! user can never land in the store out of order. Callers wait for the
//! acknowledgement after releasing their lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::chat::UserId;
use crate::config::PresenceConfig;
use crate::metrics::PresenceMetrics;
use crate::redis::{retry_with_backoff, BackoffConfig};

use super::{PresenceError, PresenceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOp {
    Online,
    Offline,
}

impl PresenceOp {
    fn as_str(&self) -> &'static str {
        match self {
            PresenceOp::Online => "online",
            PresenceOp::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub op: PresenceOp,
}

impl PresenceUpdate {
    pub fn online(user_id: UserId) -> Self {
        Self {
            user_id,
            op: PresenceOp::Online,
        }
    }

    pub fn offline(user_id: UserId) -> Self {
        Self {
            user_id,
            op: PresenceOp::Offline,
        }
    }
}

/// Resolves once the writer has applied (or given up on) an update.
#[must_use]
pub struct PresenceAck {
    rx: oneshot::Receiver<bool>,
}

impl PresenceAck {
    /// `true` when the update reached the shared store.
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct PresenceWriterConfig {
    /// Attempts per update before it is logged and dropped
    pub attempts: u32,
    pub backoff: BackoffConfig,
}

impl PresenceWriterConfig {
    pub fn from_settings(config: &PresenceConfig) -> Self {
        Self {
            attempts: config.write_attempts,
            backoff: BackoffConfig::with_delays(
                config.retry_initial_delay_ms,
                config.retry_max_delay_ms,
            ),
        }
    }
}

impl Default for PresenceWriterConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

type Job = (PresenceUpdate, oneshot::Sender<bool>);

pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    /// Create the tracker and spawn its writer task. Must be called from
    /// within a Tokio runtime.
    pub fn new(store: Arc<dyn PresenceStore>, config: PresenceWriterConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(Arc::clone(&store), config, rx));

        Arc::new(Self {
            store,
            queue: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Queue an update behind every update enqueued before it. Never blocks,
    /// so it is safe to call while holding a synchronous lock.
    pub fn enqueue(&self, update: PresenceUpdate) -> PresenceAck {
        let (ack_tx, ack_rx) = oneshot::channel();
        let queue = self.queue.lock();
        match queue.as_ref() {
            Some(tx) => {
                if tx.send((update, ack_tx)).is_err() {
                    tracing::warn!(user_id = update.user_id, "Presence writer stopped, update dropped");
                }
            }
            None => {
                tracing::debug!(user_id = update.user_id, "Presence tracker closed, update dropped");
            }
        }
        PresenceAck { rx: ack_rx }
    }

    pub async fn mark_online(&self, user_id: UserId) -> Result<(), PresenceError> {
        self.apply(PresenceUpdate::online(user_id)).await
    }

    pub async fn mark_offline(&self, user_id: UserId) -> Result<(), PresenceError> {
        self.apply(PresenceUpdate::offline(user_id)).await
    }

    async fn apply(&self, update: PresenceUpdate) -> Result<(), PresenceError> {
        if self.enqueue(update).wait().await {
            Ok(())
        } else {
            Err(PresenceError::Unavailable(format!(
                "{} for user {}",
                update.op.as_str(),
                update.user_id
            )))
        }
    }

    /// Point-in-time snapshot of every online user across all processes.
    pub async fn list_online(&self) -> Result<BTreeSet<UserId>, PresenceError> {
        self.store.members().await
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, PresenceError> {
        self.store.contains(user_id).await
    }

    /// Stop accepting updates and wait for the writer to drain the queue.
    pub async fn close(&self) {
        self.queue.lock().take();
        let writer = self.writer.lock().take();
        if let Some(handle) = writer {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Presence writer task failed");
            }
        }
    }
}

async fn run_writer(
    store: Arc<dyn PresenceStore>,
    config: PresenceWriterConfig,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    tracing::debug!(backend = store.backend_name(), "Presence writer started");

    while let Some((update, ack)) = rx.recv().await {
        let result = retry_with_backoff(&config.backoff, config.attempts, |_| {
            let store = Arc::clone(&store);
            async move {
                match update.op {
                    PresenceOp::Online => store.add(update.user_id).await,
                    PresenceOp::Offline => store.remove(update.user_id).await,
                }
            }
        })
        .await;

        PresenceMetrics::record_write(update.op.as_str(), result.is_ok());
        if let Err(e) = &result {
            tracing::error!(
                user_id = update.user_id,
                operation = update.op.as_str(),
                error = %e,
                "Presence update failed after retries"
            );
        }
        let _ = ack.send(result.is_ok());
    }

    tracing::debug!("Presence writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresenceStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tracker() -> Arc<PresenceTracker> {
        PresenceTracker::new(
            Arc::new(MemoryPresenceStore::new("a")),
            PresenceWriterConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_mark_online_then_offline() {
        let tracker = tracker();

        tracker.mark_online(1).await.unwrap();
        assert!(tracker.is_online(1).await.unwrap());

        tracker.mark_offline(1).await.unwrap();
        assert!(!tracker.is_online(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_updates_apply_in_enqueue_order() {
        let tracker = tracker();

        let first = tracker.enqueue(PresenceUpdate::online(5));
        let second = tracker.enqueue(PresenceUpdate::offline(5));
        let third = tracker.enqueue(PresenceUpdate::online(5));

        // Awaiting out of order does not change application order
        assert!(third.wait().await);
        assert!(first.wait().await);
        assert!(second.wait().await);
        assert_eq!(tracker.list_online().await.unwrap().into_iter().collect::<Vec<_>>(), vec![5]);
    }

    #[tokio::test]
    async fn test_closed_tracker_rejects_updates() {
        let tracker = tracker();
        tracker.close().await;

        assert!(!tracker.enqueue(PresenceUpdate::online(1)).wait().await);
        assert!(tracker.mark_online(1).await.is_err());
    }

    struct FlakyStore {
        inner: MemoryPresenceStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl PresenceStore for FlakyStore {
        fn backend_name(&self) -> &'static str {
            "flaky"
        }

        async fn add(&self, user_id: UserId) -> Result<(), PresenceError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(PresenceError::Unavailable("injected".into()));
            }
            self.inner.add(user_id).await
        }

        async fn remove(&self, user_id: UserId) -> Result<(), PresenceError> {
            self.inner.remove(user_id).await
        }

        async fn members(&self) -> Result<BTreeSet<UserId>, PresenceError> {
            self.inner.members().await
        }

        async fn contains(&self, user_id: UserId) -> Result<bool, PresenceError> {
            self.inner.contains(user_id).await
        }
    }

    #[tokio::test]
    async fn test_writer_retries_transient_failures() {
        let store = Arc::new(FlakyStore {
            inner: MemoryPresenceStore::new("a"),
            failures_left: AtomicU32::new(2),
        });
        let config = PresenceWriterConfig {
            attempts: 3,
            backoff: BackoffConfig {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
        };
        let tracker = PresenceTracker::new(store, config);

        tracker.mark_online(9).await.unwrap();
        assert!(tracker.is_online(9).await.unwrap());
    }
}
