use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chat::{ChannelId, Message, User, UserId};

/// Frame sent by a client on an active chat connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    pub content: String,
    /// Must match the connection's channel when present
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Notification,
    ConnectionStatus,
    Error,
}

/// Unit of fan-out. Serializes to the outbound wire shape
/// `{"message_type": ..., "channel_id": ..., "data": ...}`. Broker payloads
/// carry the same fields plus the publisher's origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    #[serde(rename = "message_type")]
    pub kind: EventKind,
    pub channel_id: ChannelId,
    pub data: Value,
}

impl DeliveryEvent {
    /// A persisted chat message
    pub fn message(message: &Message) -> Self {
        Self {
            kind: EventKind::Message,
            channel_id: message.channel_id,
            data: json!({
                "id": message.id,
                "content": message.content,
                "sender_id": message.sender_id,
                "channel_id": message.channel_id,
                "status": message.status,
                "created_at": message.created_at,
            }),
        }
    }

    pub fn notification(channel_id: ChannelId, data: impl Into<Value>) -> Self {
        Self {
            kind: EventKind::Notification,
            channel_id,
            data: data.into(),
        }
    }

    pub fn joined(channel_id: ChannelId, user: &User) -> Self {
        Self::notification(channel_id, format!("{} joined the chat", user.username))
    }

    pub fn left(channel_id: ChannelId, user: &User) -> Self {
        Self::notification(channel_id, format!("{} left the chat", user.username))
    }

    /// Announces that `reader` has read the given messages
    pub fn read_receipt(channel_id: ChannelId, reader: UserId, message_ids: &[i64]) -> Self {
        Self::notification(
            channel_id,
            json!({
                "type": "read_receipt",
                "reader_id": reader,
                "message_ids": message_ids,
            }),
        )
    }

    /// Sent only to the session that just connected
    pub fn connection_status(channel_id: ChannelId, status: &str) -> Self {
        Self {
            kind: EventKind::ConnectionStatus,
            channel_id,
            data: json!({
                "status": status,
                "channel_id": channel_id,
                "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
            }),
        }
    }

    pub fn error(channel_id: ChannelId, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            channel_id,
            data: Value::String(message.into()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageStatus;

    #[test]
    fn test_message_event_wire_shape() {
        let message = Message {
            id: 42,
            content: "hi".to_string(),
            sender_id: 1,
            channel_id: 7,
            status: MessageStatus::Sent,
            created_at: Utc::now(),
        };

        let value: Value = serde_json::from_str(&DeliveryEvent::message(&message).to_json().unwrap()).unwrap();
        assert_eq!(value["message_type"], "message");
        assert_eq!(value["channel_id"], 7);
        assert_eq!(value["data"]["content"], "hi");
        assert_eq!(value["data"]["sender_id"], 1);
        assert_eq!(value["data"]["status"], "sent");
    }

    #[test]
    fn test_broker_payload_decodes() {
        let payload = r#"{"message_type":"notification","channel_id":3,"data":"bob left the chat"}"#;
        let event = serde_json::from_str::<DeliveryEvent>(payload).unwrap();
        assert_eq!(event.kind, EventKind::Notification);
        assert_eq!(event.channel_id, 3);
        assert_eq!(event.data, Value::String("bob left the chat".into()));

        assert!(serde_json::from_str::<DeliveryEvent>(r#"{"message_type":"shout","channel_id":3,"data":1}"#).is_err());
    }

    #[test]
    fn test_inbound_frame_channel_is_optional() {
        let frame: InboundFrame = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(frame.channel_id, None);

        let frame: InboundFrame = serde_json::from_str(r#"{"content":"hi","channel_id":7}"#).unwrap();
        assert_eq!(frame.channel_id, Some(7));

        assert!(serde_json::from_str::<InboundFrame>(r#"{"text":"hi"}"#).is_err());
    }

    #[test]
    fn test_connection_status_payload() {
        let event = DeliveryEvent::connection_status(7, "connected");
        assert_eq!(event.kind, EventKind::ConnectionStatus);
        assert_eq!(event.data["status"], "connected");
        assert_eq!(event.data["channel_id"], 7);
    }
}
