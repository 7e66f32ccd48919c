//! Structured error taxonomy shared across the hub, hub client, daemon, and
//! supervisor.
//!
//! Ad-hoc glue code still returns `anyhow::Result` with `.context(...)`, the
//! same as the rest of the crate. `BridgeError` is reserved for errors that
//! cross a component boundary and need a caller-visible `kind`.

use serde::Serialize;
use std::fmt;

/// The kind of a [`BridgeError`], serialized as the `kind` field of the
/// `{status: "error", error, kind, context}` wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required parameter was missing or malformed. Never retried.
    Validation,
    /// No transport is currently available.
    NotConnected,
    /// The Hub has no registered extension peer.
    NoExtension,
    /// A deadline elapsed before completion.
    Timeout,
    /// The transport closed while a request was in flight.
    ConnectionLost,
    /// The targeted resource is already locked.
    Busy,
    /// The targeted tool, operation, server, or resource does not exist.
    NotFound,
    /// The error originated upstream (extension or tool subprocess).
    Upstream,
    /// An invariant was violated; a bug, not a caller mistake.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotConnected => "not_connected",
            Self::NoExtension => "no_extension",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection_lost",
            Self::Busy => "busy",
            Self::NotFound => "not_found",
            Self::Upstream => "upstream",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A structured error with a caller-visible [`ErrorKind`] and optional
/// free-form context.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// See [`ErrorKind::Validation`].
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable explanation.
        message: String,
    },

    /// See [`ErrorKind::NotConnected`].
    #[error("not connected to hub")]
    NotConnected,

    /// See [`ErrorKind::NoExtension`].
    #[error("no extension peer registered")]
    NoExtension,

    /// See [`ErrorKind::Timeout`].
    #[error("timed out after {elapsed_ms}ms")]
    Timeout {
        /// How long the caller waited before giving up.
        elapsed_ms: u64,
    },

    /// See [`ErrorKind::ConnectionLost`].
    #[error("connection lost while awaiting response")]
    ConnectionLost,

    /// See [`ErrorKind::Busy`].
    #[error("resource busy: {resource}")]
    Busy {
        /// Identifier of the held resource (e.g. a tab id).
        resource: String,
    },

    /// See [`ErrorKind::NotFound`].
    #[error("not found: {what}")]
    NotFound {
        /// What was being looked up.
        what: String,
    },

    /// See [`ErrorKind::Upstream`].
    #[error("upstream error: {message}")]
    Upstream {
        /// The message as reported by the extension or tool subprocess.
        message: String,
    },

    /// See [`ErrorKind::Internal`].
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// The stable [`ErrorKind`] for this error, used for wire serialization.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::NoExtension => ErrorKind::NoExtension,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionLost => ErrorKind::ConnectionLost,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Builds the `{status, error, kind}` wire payload for this error.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        WireError {
            status: "error",
            error: self.to_string(),
            kind: self.kind(),
            context: None,
        }
    }

    /// Like [`Self::to_wire`] but attaches free-form context (e.g. the
    /// `request_id` or `tool` name that produced the error).
    #[must_use]
    pub fn to_wire_with_context(&self, context: serde_json::Value) -> WireError {
        WireError {
            status: "error",
            error: self.to_string(),
            kind: self.kind(),
            context: Some(context),
        }
    }
}

/// The wire shape every caller-visible error takes, regardless of transport.
#[derive(Debug, Serialize)]
pub struct WireError {
    status: &'static str,
    error: String,
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(BridgeError::NoExtension.kind(), ErrorKind::NoExtension);
        assert_eq!(
            BridgeError::Busy { resource: "tab:1".into() }.kind(),
            ErrorKind::Busy
        );
    }

    #[test]
    fn test_to_wire_serializes_kind_snake_case() {
        let err = BridgeError::Timeout { elapsed_ms: 500 };
        let wire = err.to_wire();
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"kind\":\"timeout\""));
        assert!(json.contains("\"status\":\"error\""));
    }

    #[test]
    fn test_internal_wraps_anyhow() {
        let cause = anyhow::anyhow!("boom");
        let err: BridgeError = cause.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
