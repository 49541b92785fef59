use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::WebSocketConfig;
use crate::connection_manager::{ConnectionManager, SendFailure};
use crate::metrics::{HeartbeatMetrics, MemoryMetrics};

/// Background task that pings every session and evicts idle ones
pub struct HeartbeatTask {
    config: WebSocketConfig,
    connection_manager: Arc<ConnectionManager>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        connection_manager: Arc<ConnectionManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            connection_manager,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval.max(1));
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                }
                _ = cleanup_timer.tick() => {
                    self.evict_stale_sessions(connection_timeout).await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Enqueue a ping on every session. A ping only fails when the queue is
    /// closed or full; eviction of those sessions is left to the
    /// connection manager's next delivery or the idle sweep.
    fn send_heartbeats(&self) {
        let sessions = self.connection_manager.all_sessions();
        if sessions.is_empty() {
            return;
        }

        let start = Instant::now();
        let mut sent = 0usize;
        let mut full = 0usize;
        let mut closed = 0usize;

        for session in &sessions {
            match session.try_ping() {
                Ok(()) => sent += 1,
                Err(SendFailure::Full) => full += 1,
                Err(SendFailure::Closed) => closed += 1,
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        HeartbeatMetrics::record_duration_ms(elapsed_ms);
        MemoryMetrics::update_process_memory();

        tracing::debug!(
            total = sessions.len(),
            sent = sent,
            full = full,
            closed = closed,
            elapsed_ms = elapsed_ms,
            "Heartbeat round completed"
        );
    }

    /// Disconnect sessions with no inbound activity within `timeout_secs`,
    /// and sessions that are already closed but still registered.
    async fn evict_stale_sessions(&self, timeout_secs: u64) {
        let mut evicted = 0u64;

        for session in self.connection_manager.all_sessions() {
            if session.is_stale(timeout_secs) || !session.is_open() {
                if self.connection_manager.evict(&session).await {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            HeartbeatMetrics::record_evicted(evicted);
            tracing::info!(
                evicted = evicted,
                timeout_secs = timeout_secs,
                "Evicted idle sessions"
            );
        }
    }
}
