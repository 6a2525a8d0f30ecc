//! Chat payloads: The application-level messages a chat client exchanges
//! as typed objects.
//!
//! These are thin wrappers over [`Message`]; nothing in the core depends on
//! them. Register them on a node with [`register_chat_types`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{NodeId, NodeIdentity};
use crate::message::Message;
use crate::router::TypeRouter;

/// A chat line typed by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: NodeId,
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(from: &NodeIdentity, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: from.node_id.clone(),
            sender_name: from.name.clone(),
            content: content.into(),
            sent_at: Utc::now(),
        }
    }
}

impl Message for ChatMessage {
    const TYPE_NAME: &'static str = "chat.message";
}

/// A notice generated by the application rather than a user (joins, leaves).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl SystemMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sent_at: Utc::now(),
        }
    }
}

impl Message for SystemMessage {
    const TYPE_NAME: &'static str = "chat.system";
}

/// Asks connected peers to identify themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub node_id: NodeId,
    pub name: String,
}

impl Message for DiscoveryRequest {
    const TYPE_NAME: &'static str = "chat.discovery_request";
}

/// Answer to a [`DiscoveryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub node_id: NodeId,
    pub name: String,
    pub tcp_port: u16,
}

impl Message for DiscoveryResponse {
    const TYPE_NAME: &'static str = "chat.discovery_response";
}

/// Register every chat payload type on a router.
pub fn register_chat_types(router: &mut TypeRouter) {
    router.register::<ChatMessage>();
    router.register::<SystemMessage>();
    router.register::<DiscoveryRequest>();
    router.register::<DiscoveryResponse>();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;
    use crate::router::Resolution;

    #[test]
    fn test_chat_message_from_identity() {
        let me = NodeIdentity::generate("alice");
        let msg = ChatMessage::new(&me, "hi all");
        assert_eq!(msg.sender_id, me.node_id);
        assert_eq!(msg.sender_name, "alice");
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_register_chat_types() {
        let mut router = TypeRouter::new();
        register_chat_types(&mut router);
        assert_eq!(router.type_count(), 4);
        assert!(router.has_type("chat.message"));
        assert!(router.has_type("chat.discovery_response"));
    }

    #[test]
    fn test_chat_message_resolves_through_router() {
        let mut router = TypeRouter::new();
        register_chat_types(&mut router);

        let me = NodeIdentity::generate("bob");
        let env = Envelope::wrap(&ChatMessage::new(&me, "ping")).unwrap();
        let Resolution::Resolved(resolved) = router.resolve(&env) else {
            panic!("chat message should resolve");
        };
        assert_eq!(resolved.downcast_ref::<ChatMessage>().unwrap().content, "ping");
    }

    #[test]
    fn test_type_names_are_distinct() {
        let names = [
            ChatMessage::TYPE_NAME,
            SystemMessage::TYPE_NAME,
            DiscoveryRequest::TYPE_NAME,
            DiscoveryResponse::TYPE_NAME,
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
