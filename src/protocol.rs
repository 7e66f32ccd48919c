//! Wire envelope types for the Hub bus.
//!
//! One JSON object per message (see [`crate::framing`]), tagged by `type`.
//! Hosts only ever originate [`HostFrame::Request`]; the extension only
//! ever originates [`ExtensionFrame::Response`]/[`ExtensionFrame::Error`]
//! for a prior request. Both sides may send `keepalive`/`event`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A peer's declared role when registering with the Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    /// The singleton browser extension.
    Extension,
    /// Any other participant (editor, CLI, tool).
    Host,
}

/// Frames a Hub may receive from a host connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// First frame on a new host connection.
    RegisterHost {
        /// Caller-assigned identity, falls back to ancestry detection.
        client_id: Option<String>,
        /// Display name for logs and extension-side UI.
        name: Option<String>,
    },
    /// Forwarded verbatim to the extension.
    Request {
        /// Unique within the originating hub client.
        request_id: String,
        /// Tool-calling method name.
        method: String,
        /// Method parameters.
        params: Value,
    },
    /// Liveness probe; answered immediately with `KeepaliveAck`.
    Keepalive,
}

/// Frames a Hub may receive from the extension connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionFrame {
    /// First frame on the extension connection.
    RegisterExtension {
        /// Extension build identifier, for logs.
        version: Option<String>,
    },
    /// Routed to the host whose `request_id` matches.
    Response {
        /// Echoes the originating request.
        request_id: String,
        /// The id of the host that should receive this response.
        target_peer_id: String,
        /// Tool result payload.
        result: Value,
    },
    /// Routed to the host whose `request_id` matches, as a failure.
    Error {
        /// Echoes the originating request.
        request_id: String,
        /// The id of the host that should receive this error.
        target_peer_id: String,
        /// Error message.
        error: String,
        /// Stable error kind, when known.
        kind: Option<String>,
    },
    /// Advisory progress update for a registered operation.
    Milestone {
        /// The operation being updated.
        operation_id: String,
        /// Milestone label (`started`, `completed`, `error`, ...).
        label: String,
        /// Arbitrary milestone payload.
        data: Option<Value>,
    },
    /// Liveness probe; answered immediately with `KeepaliveAck`.
    Keepalive,
    /// Informational event, not tied to a request.
    Event {
        /// Event name (`connection_changed`, `client_joined`, ...).
        name: String,
        /// Event payload.
        data: Value,
    },
}

/// Frames a Hub sends to a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubToHost {
    /// Sent immediately after a successful `register_host`.
    RegistrationAck {
        /// The peer id assigned to this connection.
        peer_id: String,
    },
    /// Forwarded from the extension.
    Response {
        /// Echoes the originating request.
        request_id: String,
        /// Tool result payload.
        result: Value,
    },
    /// Forwarded from the extension, or synthesized locally (e.g. `NoExtension`).
    Error {
        /// Echoes the originating request.
        request_id: String,
        /// Error message.
        error: String,
        /// Stable error kind, when known.
        kind: Option<String>,
    },
    /// Forwarded from the extension.
    Milestone {
        /// The operation being updated.
        operation_id: String,
        /// Milestone label.
        label: String,
        /// Arbitrary milestone payload.
        data: Option<Value>,
    },
    /// Answers a host's `keepalive`.
    KeepaliveAck,
    /// The Hub is shutting down; peers should expect the connection to
    /// close shortly.
    HubShutdown,
}

/// Frames a Hub sends to the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubToExtension {
    /// Sent immediately after a successful `register_extension`.
    RegistrationAck {
        /// The peer id assigned to this connection.
        peer_id: String,
    },
    /// Forwarded from a host, annotated with routing metadata.
    Request {
        /// Unique within the originating hub client.
        request_id: String,
        /// Tool-calling method name.
        method: String,
        /// Method parameters.
        params: Value,
        /// The host that should receive the eventual response.
        origin_peer_id: String,
    },
    /// Snapshot of the registered peers, emitted on every membership change.
    Event {
        /// Event name.
        name: String,
        /// Event payload — typically `{peers: [...]}`.
        data: Value,
    },
    /// Answers the extension's `keepalive`.
    KeepaliveAck,
    /// The Hub is shutting down.
    HubShutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_request_round_trips_through_json() {
        let frame = HostFrame::Request {
            request_id: "r1".into(),
            method: "tabs.create".into(),
            params: serde_json::json!({"url": "https://claude.ai"}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"request\""));
        let decoded: HostFrame = serde_json::from_str(&json).unwrap();
        match decoded {
            HostFrame::Request { request_id, method, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(method, "tabs.create");
            }
            _ => panic!("expected Request"),
        }
    }

    #[test]
    fn test_extension_error_includes_kind() {
        let frame = ExtensionFrame::Error {
            request_id: "r2".into(),
            target_peer_id: "host-1".into(),
            error: "tab closed".into(),
            kind: Some("not_found".into()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "not_found");
    }

    #[test]
    fn test_unknown_type_fails_to_deserialize() {
        let raw = r#"{"type":"not_a_real_frame"}"#;
        let result: Result<HostFrame, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }
}
