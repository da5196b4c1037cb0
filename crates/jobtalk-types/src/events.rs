use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// A newly persisted message, as delivered by the live feed.
///
/// The feed only carries inserts: read-flag changes are not pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInsert {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_marker: Option<Uuid>,
}

impl From<&Message> for MessageInsert {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: message.created_at,
            client_marker: message.client_marker,
        }
    }
}

impl From<MessageInsert> for Message {
    fn from(insert: MessageInsert) -> Self {
        Self {
            id: insert.id,
            conversation_id: insert.conversation_id,
            sender_id: insert.sender_id,
            content: insert.content,
            created_at: insert.created_at,
            read: false,
            client_marker: insert.client_marker,
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the authenticated connection
    Ready { user_id: Uuid },

    /// A message was inserted into a subscribed conversation
    MessageInsert(MessageInsert),

    /// The conversation is now subscribed; inserts after this point are delivered
    Subscribed { conversation_id: Uuid },

    /// A subscription request named a conversation the user is not part of
    SubscribeRejected { conversation_id: Uuid },
}

impl GatewayEvent {
    /// Returns the conversation this event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageInsert(insert) => Some(insert.conversation_id),
            Self::Subscribed { conversation_id } | Self::SubscribeRejected { conversation_id } => {
                Some(*conversation_id)
            }
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving inserts for these conversations ("from now" only).
    Subscribe { conversation_ids: Vec<Uuid> },

    /// Stop receiving inserts for these conversations.
    Unsubscribe { conversation_ids: Vec<Uuid> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_event_wire_format() {
        let insert = MessageInsert {
            id: Uuid::nil(),
            conversation_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            content: "Hello".into(),
            created_at: DateTime::from_timestamp(0, 0).unwrap(),
            client_marker: None,
        };
        let json = serde_json::to_value(GatewayEvent::MessageInsert(insert)).unwrap();

        assert_eq!(json["type"], "MessageInsert");
        assert_eq!(json["data"]["content"], "Hello");
        assert!(json["data"].get("client_marker").is_none());
    }

    #[test]
    fn subscribe_command_parses() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"Subscribe","data":{{"conversation_ids":["{}"]}}}}"#, id);
        match serde_json::from_str::<GatewayCommand>(&raw).unwrap() {
            GatewayCommand::Subscribe { conversation_ids } => assert_eq!(conversation_ids, vec![id]),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
