//! Bridge between the broker and locally held sessions.
//!
//! Every process subscribes to `{prefix}:{channel_id}` for each channel it
//! has local subscribers in, and hands inbound events to a [`ChannelSink`]
//! (the connection manager). Outbound events are published to the same
//! topic, so the origin process receives its own messages through the
//! broker like every other process.

mod bridge;

use std::sync::Arc;

use crate::chat::ChannelId;
use crate::websocket::DeliveryEvent;

pub use bridge::{FanoutBridge, FanoutConfig, SubscriptionHandle};

/// Receiver of events arriving on a channel subscription.
///
/// `deliver` runs on the subscription task and must not block: it may only
/// enqueue into per-session bounded queues. `own_sequence` is set when this
/// process published the event, to the sequence it was published under.
pub trait ChannelSink: Send + Sync + 'static {
    fn deliver(
        &self,
        channel_id: ChannelId,
        generation: u64,
        event: Arc<DeliveryEvent>,
        own_sequence: Option<u64>,
    );
}
