//! Connection statistics exposed by the stats endpoint

use serde::Serialize;
use std::collections::HashMap;

use crate::chat::{ChannelId, UserId};

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_sessions: usize,
    pub unique_users: usize,
    /// Local subscribers per channel
    pub channels: HashMap<ChannelId, usize>,
    /// Channels with a broker subscription task
    pub broker_subscriptions: usize,
    /// Broker subscriptions currently receiving
    pub live_subscriptions: usize,
}

/// Result of fanning one event out to a channel's local sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Users whose session was dropped because it could not accept the event
    pub failed_users: Vec<UserId>,
}
