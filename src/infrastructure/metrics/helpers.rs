//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BACKEND_ERRORS_TOTAL, BACKEND_OPERATION_LATENCY, BROKER_DECODE_ERRORS,
    BROKER_MESSAGES_RECEIVED, BROKER_PUBLISH_FAILURES, BROKER_RESUBSCRIBES_TOTAL,
    BROKER_SUBSCRIPTIONS, CHANNELS_ACTIVE, DELIVERY_FAILURES_TOTAL, EVENTS_DELIVERED_TOTAL,
    EVENTS_PUBLISHED_TOTAL, HEARTBEAT_DURATION_MS, MESSAGES_PERSISTED_TOTAL,
    PRESENCE_WRITES_TOTAL, PROCESS_MEMORY_BYTES, SESSIONS_ACTIVE, SESSIONS_EVICTED_TOTAL,
    SESSIONS_SUPERSEDED_TOTAL, USERS_CONNECTED, WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED,
    WS_CONNECTIONS_REJECTED, WS_CONNECTION_DURATION, WS_FRAMES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Gauges mirroring the connection manager's registry
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn set_counts(sessions: usize, users: usize, channels: usize) {
        SESSIONS_ACTIVE.set(sessions as i64);
        USERS_CONNECTED.set(users as i64);
        CHANNELS_ACTIVE.set(channels as i64);
    }

    pub fn record_superseded() {
        SESSIONS_SUPERSEDED_TOTAL.inc();
    }
}

/// Helper struct for recording delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    /// Record a publish and how it was delivered
    pub fn record_published(outcome: &str) {
        EVENTS_PUBLISHED_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Record successful local deliveries
    pub fn record_delivered(count: u64) {
        EVENTS_DELIVERED_TOTAL.inc_by(count);
    }

    /// Record a session dropped because its queue was closed
    pub fn record_closed() {
        DELIVERY_FAILURES_TOTAL.with_label_values(&["closed"]).inc();
    }

    /// Record a session dropped because its queue was full
    pub fn record_full() {
        DELIVERY_FAILURES_TOTAL.with_label_values(&["full"]).inc();
    }

    pub fn record_persisted() {
        MESSAGES_PERSISTED_TOTAL.inc();
    }
}

/// Helper struct for broker subscription metrics
pub struct BrokerMetrics;

impl BrokerMetrics {
    pub fn subscription_opened() {
        BROKER_SUBSCRIPTIONS.inc();
    }

    pub fn subscription_closed() {
        BROKER_SUBSCRIPTIONS.dec();
    }

    pub fn record_received() {
        BROKER_MESSAGES_RECEIVED.inc();
    }

    pub fn record_decode_error() {
        BROKER_DECODE_ERRORS.inc();
    }

    pub fn record_publish_failure() {
        BROKER_PUBLISH_FAILURES.inc();
    }

    pub fn record_resubscribe() {
        BROKER_RESUBSCRIBES_TOTAL.inc();
    }
}

/// Helper struct for presence write metrics
pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_write(operation: &str, success: bool) {
        let result = if success { "ok" } else { "error" };
        PRESENCE_WRITES_TOTAL
            .with_label_values(&[operation, result])
            .inc();
    }
}

/// Helper struct for WebSocket lifecycle metrics
pub struct WsMetrics;

impl WsMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    /// Record a closed connection and how long it lived
    pub fn record_closed(duration_secs: f64) {
        WS_CONNECTIONS_CLOSED.inc();
        WS_CONNECTION_DURATION.observe(duration_secs);
    }

    pub fn record_rejected(reason: &str) {
        WS_CONNECTIONS_REJECTED.with_label_values(&[reason]).inc();
    }

    /// Record an inbound frame by kind (text, binary, ping, pong, close)
    pub fn record_frame(kind: &str) {
        WS_FRAMES_RECEIVED.with_label_values(&[kind]).inc();
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    /// Record heartbeat round duration
    pub fn record_duration_ms(duration_ms: u64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms as f64);
    }

    pub fn record_evicted(count: u64) {
        SESSIONS_EVICTED_TOTAL.inc_by(count);
    }
}

/// Helper struct for memory metrics
pub struct MemoryMetrics;

impl MemoryMetrics {
    /// Update process memory metric (call periodically)
    pub fn update_process_memory() {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                let rss_kb = status
                    .lines()
                    .find(|line| line.starts_with("VmRSS:"))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<i64>().ok());
                if let Some(kb) = rss_kb {
                    PROCESS_MEMORY_BYTES.set(kb * 1024);
                }
            }
        }
    }
}

/// Helper struct for store/broker/presence backend metrics
pub struct BackendMetrics;

impl BackendMetrics {
    /// Record backend operation latency
    pub fn record_latency(backend: &str, operation: &str, latency_secs: f64) {
        BACKEND_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(latency_secs);
    }

    /// Record backend error
    pub fn record_error(backend: &str, operation: &str) {
        BACKEND_ERRORS_TOTAL
            .with_label_values(&[backend, operation])
            .inc();
    }
}
