//! The routed envelope.

use crate::{HUB_NID, Message};
use serde::{Deserialize, Serialize};

/// An addressed, correlated [`Message`].
///
/// `destination` is a nid, a link type, [`NULL_DESTINATION`](crate::NULL_DESTINATION)
/// or [`HUB_NID`]. `conversation_id` is set once when a request is created
/// and copied onto every reply and every routed copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub data: Message,
    pub source: String,
    pub destination: String,
    pub conversation_id: String,
}

impl Package {
    /// Start a new conversation.
    pub fn request(
        data: Message,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            data,
            source: source.into(),
            destination: destination.into(),
            conversation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// A package sent by the hub itself.
    pub fn from_hub(data: Message, destination: impl Into<String>) -> Self {
        Self::request(data, HUB_NID, destination)
    }

    /// Answer `request`, addressed back to its source.
    pub fn reply_to(request: &Package, data: Message) -> Self {
        Self {
            data,
            source: request.destination.clone(),
            destination: request.source.clone(),
            conversation_id: request.conversation_id.clone(),
        }
    }

    /// A copy of this package readdressed for delivery.
    pub fn forward_to(&self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            data: self.data.clone(),
            source: source.into(),
            destination: destination.into(),
            conversation_id: self.conversation_id.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A package could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
#[error("malformed package: {0}")]
pub struct CodecError(#[from] serde_json::Error);

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> Message {
        Message::data("ping", serde_json::Value::Null)
    }

    #[test]
    fn requests_get_fresh_conversation_ids() {
        let a = Package::request(ping(), "A1", "B1");
        let b = Package::request(ping(), "A1", "B1");
        assert!(!a.conversation_id.is_empty());
        assert_ne!(a.conversation_id, b.conversation_id);
    }

    #[test]
    fn reply_swaps_addresses_and_keeps_conversation() {
        let req = Package::request(ping(), "A1", "B1");
        let reply = Package::reply_to(&req, Message::data("pong", serde_json::Value::Null));
        assert_eq!(reply.source, "B1");
        assert_eq!(reply.destination, "A1");
        assert_eq!(reply.conversation_id, req.conversation_id);
    }

    #[test]
    fn forward_keeps_payload_and_conversation() {
        let mut req = Package::request(ping(), "spoofed", "discord");
        req.conversation_id = "c1".into();
        let copy = req.forward_to("A1", "B1");
        assert_eq!(copy.data, req.data);
        assert_eq!(copy.source, "A1");
        assert_eq!(copy.destination, "B1");
        assert_eq!(copy.conversation_id, "c1");
    }

    #[test]
    fn hub_packages_come_from_the_hub() {
        let pkg = Package::from_hub(Message::IdentifySuccessful, "A1");
        assert_eq!(pkg.source, HUB_NID);
        assert_eq!(pkg.destination, "A1");
    }

    #[test]
    fn bytes_roundtrip() {
        let pkg = Package::request(ping(), "A1", "telegram");
        let decoded = Package::from_bytes(&pkg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, pkg);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Package::from_bytes(b"\x80\x04not json").is_err());
        assert!(Package::from_bytes(br#"{"source":"A1"}"#).is_err());
    }
}
