//! Chat domain records shared by the store, the delivery endpoint and the
//! REST handlers.

mod types;

pub use types::{Channel, ChannelId, ChannelKind, Message, MessageStatus, User, UserId, UserStatus};
