//! Cross-replica event distribution.
//!
//! Mutation handlers publish [`Envelope`]s to logical channels; every
//! backend replica receives them through its [`Broker`] and forwards to
//! locally connected WebSocket subscribers. Delivery is at-most-once:
//! replicas tolerate short gaps and clients re-fetch on reconnect.

mod broker;
mod typing;

pub use broker::{Broker, BusMessage, BusSubscriber, InMemoryBroker, RedisBroker, SharedBroker};
pub use typing::{TypingTracker, TypingUser, TYPING_TTL};

use serde::{Deserialize, Serialize};

/// Wire prefix for broadcast channels on the distributed bus.
pub const BROADCAST_PREFIX: &str = "ws:broadcast:";

/// One broadcast event as carried on the bus and delivered to sockets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub channel: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, channel: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            channel: channel.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_a_type_discriminant() {
        let envelope = Envelope::new("message:new", "course:abc", serde_json::json!({"id": 1}));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "message:new");
        assert_eq!(json["channel"], "course:abc");
        assert_eq!(json["data"]["id"], 1);
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::new("typing:update", "submission_group:g1", serde_json::json!({}));
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }
}
