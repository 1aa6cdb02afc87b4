//! The client/server WebSocket envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to a channel by resolved path (e.g. `sessionContainers/<uuid>`).
    Subscribe { channel: String },

    /// Unsubscribe from a channel.
    Unsubscribe { channel: String },

    /// A client event for a channel the socket is subscribed to.
    Event { channel: String, data: Value },

    /// Keepalive probe; the server answers with `pong`.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Full channel state, sent once per subscription before any delta.
    Snapshot { channel: String, data: Value },

    /// An incremental update the client applies to its snapshot.
    Delta { channel: String, data: Value },

    /// A server-originated event (channels with event semantics).
    Event { channel: String, data: Value },

    /// A per-channel error (authorization, unknown channel, ...).
    Error { channel: String, error: String },

    /// Keepalive reply.
    Pong,
}

impl ServerMessage {
    /// The channel path this message is scoped to, when it has one.
    pub fn channel(&self) -> Option<&str> {
        match self {
            ServerMessage::Snapshot { channel, .. }
            | ServerMessage::Delta { channel, .. }
            | ServerMessage::Event { channel, .. }
            | ServerMessage::Error { channel, .. } => Some(channel),
            ServerMessage::Pong => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_message_roundtrip() {
        let raw = r#"{"type":"subscribe","channel":"sessions"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                channel: "sessions".to_string()
            }
        );
    }

    #[test]
    fn ping_has_no_extra_fields() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn server_message_serializes_tagged() {
        let msg = ServerMessage::Delta {
            channel: "sessions".to_string(),
            data: json!({"type": "add", "id": "abc"}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "delta");
        assert_eq!(value["channel"], "sessions");
        assert_eq!(value["data"]["id"], "abc");
    }
}
