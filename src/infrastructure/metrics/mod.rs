//! Prometheus metrics for the chat delivery service.
//!
//! - Session metrics (active sessions, connected users, live channels)
//! - Delivery metrics (publish outcome, local deliveries, dropped sessions)
//! - Broker and presence backend health
//! - WebSocket lifecycle and heartbeat metrics

mod helpers;

pub use helpers::{
    encode_metrics, BackendMetrics, BrokerMetrics, DeliveryMetrics, HeartbeatMetrics,
    MemoryMetrics, PresenceMetrics, SessionMetrics, WsMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "chat";

lazy_static! {
    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Live (user, channel) sessions on this process
    pub static ref SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_sessions_active", METRIC_PREFIX),
        "Number of live sessions on this process"
    ).unwrap();

    /// Distinct users with at least one session on this process
    pub static ref USERS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_users_connected", METRIC_PREFIX),
        "Number of distinct users connected to this process"
    ).unwrap();

    /// Channels with at least one local subscriber
    pub static ref CHANNELS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_channels_active", METRIC_PREFIX),
        "Number of channels with at least one local subscriber"
    ).unwrap();

    /// Sessions replaced by a newer session for the same (user, channel)
    pub static ref SESSIONS_SUPERSEDED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_superseded_total", METRIC_PREFIX),
        "Total sessions replaced by a newer session for the same user and channel"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Events published, by outcome (broker, local_echo, local_only)
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_published_total", METRIC_PREFIX),
        "Total events published by outcome",
        &["outcome"]
    ).unwrap();

    /// Events handed to a local session's outbound queue
    pub static ref EVENTS_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_events_delivered_total", METRIC_PREFIX),
        "Total events enqueued to local sessions"
    ).unwrap();

    /// Failed local deliveries, by reason (closed, full)
    pub static ref DELIVERY_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_failures_total", METRIC_PREFIX),
        "Total failed local deliveries by reason",
        &["reason"]
    ).unwrap();

    /// Messages written to the chat store
    pub static ref MESSAGES_PERSISTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_persisted_total", METRIC_PREFIX),
        "Total chat messages persisted"
    ).unwrap();

    // ============================================================================
    // Broker Metrics
    // ============================================================================

    /// Live broker subscriptions held by this process
    pub static ref BROKER_SUBSCRIPTIONS: IntGauge = register_int_gauge!(
        format!("{}_broker_subscriptions", METRIC_PREFIX),
        "Number of live broker topic subscriptions"
    ).unwrap();

    /// Payloads received from the broker
    pub static ref BROKER_MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        format!("{}_broker_messages_received_total", METRIC_PREFIX),
        "Total payloads received from broker subscriptions"
    ).unwrap();

    /// Payloads that failed to decode
    pub static ref BROKER_DECODE_ERRORS: IntCounter = register_int_counter!(
        format!("{}_broker_decode_errors_total", METRIC_PREFIX),
        "Total broker payloads that could not be decoded"
    ).unwrap();

    /// Publishes that failed after every retry
    pub static ref BROKER_PUBLISH_FAILURES: IntCounter = register_int_counter!(
        format!("{}_broker_publish_failures_total", METRIC_PREFIX),
        "Total broker publishes that failed after retries"
    ).unwrap();

    /// Subscription attempts after a failure or a closed stream
    pub static ref BROKER_RESUBSCRIBES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broker_resubscribes_total", METRIC_PREFIX),
        "Total broker resubscription attempts"
    ).unwrap();

    /// Redis connection status (1 = connected, 0 = disconnected)
    pub static ref REDIS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_redis_connection_status", METRIC_PREFIX),
        "Redis connection status (1=connected, 0=disconnected)"
    ).unwrap();

    // ============================================================================
    // Presence Metrics
    // ============================================================================

    /// Presence writes, by operation and result
    pub static ref PRESENCE_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_writes_total", METRIC_PREFIX),
        "Total presence writes by operation and result",
        &["operation", "result"]
    ).unwrap();

    // ============================================================================
    // WebSocket Metrics
    // ============================================================================

    /// WebSocket connections opened
    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    /// WebSocket connections closed
    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Connection attempts refused during admission
    pub static ref WS_CONNECTIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_connections_rejected_total", METRIC_PREFIX),
        "Total WebSocket connections rejected by reason",
        &["reason"]
    ).unwrap();

    /// WebSocket frames received from clients
    pub static ref WS_FRAMES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_frames_received_total", METRIC_PREFIX),
        "Total WebSocket frames received from clients",
        &["type"]
    ).unwrap();

    /// WebSocket connection duration
    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Heartbeat & Process Metrics
    // ============================================================================

    /// Heartbeat round duration in milliseconds
    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    ).unwrap();

    /// Sessions evicted for inactivity or a failed ping
    pub static ref SESSIONS_EVICTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_evicted_total", METRIC_PREFIX),
        "Total sessions evicted by the heartbeat task"
    ).unwrap();

    /// Process memory usage (resident set size) in bytes
    pub static ref PROCESS_MEMORY_BYTES: IntGauge = register_int_gauge!(
        format!("{}_process_memory_bytes", METRIC_PREFIX),
        "Process memory usage (RSS) in bytes"
    ).unwrap();

    // ============================================================================
    // Backend Metrics
    // ============================================================================

    /// Backend operation latency
    pub static ref BACKEND_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_backend_operation_latency_seconds", METRIC_PREFIX),
        "Backend operation latency in seconds",
        &["backend", "operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    /// Backend operation errors
    pub static ref BACKEND_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_backend_errors_total", METRIC_PREFIX),
        "Total backend operation errors",
        &["backend", "operation"]
    ).unwrap();
}
