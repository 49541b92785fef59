//! Graceful shutdown of the chat delivery service.
//!
//! 1. Tell every connected client the server is going away
//! 2. Stop background tasks
//! 3. Tear down the connection manager (sessions, broker subscriptions,
//!    this process's presence entries)
//! 4. Flush the presence writer

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection_manager::ConnectionManager;
use crate::presence::PresenceTracker;
use crate::websocket::DeliveryEvent;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for closing sessions and releasing subscriptions
    pub teardown_timeout: Duration,
    /// Time allowed for outstanding presence writes
    pub presence_flush_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            teardown_timeout: Duration::from_secs(10),
            presence_flush_timeout: Duration::from_secs(5),
        }
    }
}

pub struct GracefulShutdown {
    connection_manager: Arc<ConnectionManager>,
    presence: Arc<PresenceTracker>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        presence: Arc<PresenceTracker>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(connection_manager, presence, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        connection_manager: Arc<ConnectionManager>,
        presence: Arc<PresenceTracker>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            connection_manager,
            presence,
            shutdown_tx,
            config,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_sessions = self.connection_manager.stats().total_sessions)
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients(reason);

        tracing::info!("Phase 2: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 3: Closing sessions and broker subscriptions");
        result.sessions_closed = self.connection_manager.stats().total_sessions;
        result.teardown_completed = timeout(self.config.teardown_timeout, self.connection_manager.shutdown())
            .await
            .is_ok();
        if !result.teardown_completed {
            tracing::warn!("Connection manager teardown timed out");
        }

        tracing::info!("Phase 4: Flushing presence writes");
        result.presence_flushed = timeout(self.config.presence_flush_timeout, self.presence.close())
            .await
            .is_ok();
        if !result.presence_flushed {
            tracing::warn!("Presence flush timed out, some entries may be stale");
        }

        result.duration = start.elapsed();

        tracing::info!(
            clients_notified = result.clients_notified,
            sessions_closed = result.sessions_closed,
            teardown_completed = result.teardown_completed,
            presence_flushed = result.presence_flushed,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    /// Enqueue a shutdown notice on every session. Never waits on sockets.
    fn notify_clients(&self, reason: &str) -> usize {
        let sessions = self.connection_manager.all_sessions();
        let mut notified = 0;

        for session in sessions {
            let event = Arc::new(DeliveryEvent::connection_status(session.channel_id, "shutting_down"));
            if session.try_deliver(event).is_ok() {
                notified += 1;
            }
        }

        tracing::info!(notified = notified, reason = %reason, "Shutdown notices enqueued");
        notified
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub clients_notified: usize,
    /// Sessions registered when teardown started
    pub sessions_closed: usize,
    pub teardown_completed: bool,
    pub presence_flushed: bool,
    pub duration: Duration,
}
