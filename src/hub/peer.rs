//! Peer bookkeeping: identity, outbound channel, activity tracking.

use crate::protocol::PeerKind;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One frame queued on a peer's serialized outbound channel.
pub enum OutboundFrame {
    /// A JSON line to send as a text frame.
    Text(String),
    /// A WebSocket ping, originated by the Hub's liveness sweep.
    Ping,
    /// A WebSocket pong, answering a ping this peer sent us.
    Pong(Vec<u8>),
}

/// A single connected peer (extension or host).
pub struct Peer {
    /// Hub-assigned connection id. Stable for the life of the connection.
    pub id: String,
    /// Declared role.
    pub kind: PeerKind,
    /// Caller-supplied display name, if any.
    pub name: Option<String>,
    /// Serialized writer: every outbound frame for this peer goes through
    /// this channel so frames from concurrent routing tasks never interleave
    /// on the wire.
    pub outbox: mpsc::UnboundedSender<OutboundFrame>,
    /// Last time a frame was received from or sent to this peer.
    pub last_activity: Instant,
    /// Cancelled to force-close this peer's connection, independent of the
    /// socket actually noticing anything is wrong.
    pub cancel: CancellationToken,
}

impl Peer {
    /// Sends a pre-serialized JSON line to this peer's writer task.
    /// Silently drops if the peer's connection has already closed —
    /// the reader task will observe the close independently.
    pub fn send_line(&self, line: String) {
        let _ = self.outbox.send(OutboundFrame::Text(line));
    }

    /// Queues a liveness ping, originated by the Hub's health sweep.
    pub fn send_ping(&self) {
        let _ = self.outbox.send(OutboundFrame::Ping);
    }

    /// A snapshot-friendly view of this peer for event payloads.
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            name: self.name.clone(),
        }
    }
}

/// Serializable, lock-free snapshot of a peer for `connection_changed`-style
/// events.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerSnapshot {
    /// Hub-assigned connection id.
    pub id: String,
    /// Declared role.
    pub kind: PeerKind,
    /// Caller-supplied display name, if any.
    pub name: Option<String>,
}
