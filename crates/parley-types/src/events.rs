use serde::{Deserialize, Serialize};

use crate::models::{Message, Reaction};
use crate::scope::ConversationScope;

/// Row-level change delivered by a conversation subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    /// A message was posted
    Insert(Message),

    /// A message's content or attachments changed
    Update(Message),

    /// A message was removed from the store
    Delete { id: String },
}

impl FeedEvent {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Insert(m) | Self::Update(m) => &m.id,
            Self::Delete { id } => id,
        }
    }
}

/// Row-level change delivered by a reaction subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ReactionEvent {
    Insert(Reaction),
    Delete(Reaction),
}

impl ReactionEvent {
    pub fn reaction(&self) -> &Reaction {
        match self {
            Self::Insert(r) | Self::Delete(r) => r,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.reaction().message_id
    }
}

/// What a gateway subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum Topic {
    Conversation { scope: ConversationScope },
    Reactions { message_id: String },
}

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: String },

    /// A conversation subscription matched a message change
    Message { subscription: u64, event: FeedEvent },

    /// A reaction subscription matched a reaction change
    Reaction { subscription: u64, event: ReactionEvent },

    /// The server ended a subscription; the client must resubscribe
    SubscriptionClosed { subscription: u64 },
}

impl GatewayEvent {
    /// Returns the subscription this event is routed to.
    /// `Ready` is connection-wide and returns `None`.
    pub fn subscription(&self) -> Option<u64> {
        match self {
            Self::Message { subscription, .. }
            | Self::Reaction { subscription, .. }
            | Self::SubscriptionClosed { subscription } => Some(*subscription),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving changes for `topic`, tagged with `subscription`
    Subscribe { subscription: u64, topic: Topic },

    /// Stop receiving changes for `subscription`
    Unsubscribe { subscription: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_event_wire_shape() {
        let event = FeedEvent::Delete { id: "m1".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "Delete", "data": { "id": "m1" } }));
    }

    #[test]
    fn subscribe_command_wire_shape() {
        let cmd = GatewayCommand::Subscribe {
            subscription: 7,
            topic: Topic::Conversation {
                scope: ConversationScope::channel("general"),
            },
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "Subscribe");
        assert_eq!(json["data"]["topic"]["topic"], "Conversation");
        assert_eq!(json["data"]["topic"]["scope"]["Channel"], "general");
    }

    #[test]
    fn ready_is_not_routed() {
        let ready = GatewayEvent::Ready { user_id: "alice".into() };
        assert_eq!(ready.subscription(), None);
        let closed = GatewayEvent::SubscriptionClosed { subscription: 3 };
        assert_eq!(closed.subscription(), Some(3));
    }
}
