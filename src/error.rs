//! Typed error taxonomy for boundary-crossing failures (SPEC_FULL.md §7.1).
//!
//! Internal setup/transport plumbing that is always folded into a metrics
//! counter and a `fail(entry)` call before reaching a caller uses
//! `anyhow::Result` instead — these types are reserved for the handful of
//! failures that are genuinely surfaced to a caller: encode/decode errors
//! and bind failures on user-initiated long-lived loops.

use crate::registry::{SocketPattern, SocketRole};

/// Failure to encode a caller-supplied payload for the wire.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The JSON backend failed to serialize the value.
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
    /// The MessagePack backend failed to serialize the value.
    #[error("messagepack encode failed: {0}")]
    MessagePack(#[from] rmp_serde::encode::Error),
}

/// Failure to decode a received frame into a [`crate::payload::Payload`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The JSON backend failed to deserialize the bytes.
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
    /// The MessagePack backend failed to deserialize the bytes.
    #[error("messagepack decode failed: {0}")]
    MessagePack(#[from] rmp_serde::decode::Error),
    /// A multipart message did not have the expected number of frames.
    #[error("expected {expected} frame(s), got {got}")]
    FrameShape {
        /// Number of frames the envelope requires.
        expected: usize,
        /// Number of frames actually received.
        got: usize,
    },
    /// The topic frame was not valid UTF-8.
    #[error("topic frame was not valid utf-8: {0}")]
    InvalidTopic(#[from] std::str::Utf8Error),
}

/// A bind-side socket construction failure, surfaced only to the caller
/// that initiated the bind (`subscribe_loop`, `pull_results_loop`,
/// `response_loop`) — never to senders, which acquire sockets lazily.
#[derive(Debug, thiserror::Error)]
#[error("failed to bind {pattern:?} socket on port {port}: {source}")]
pub struct BindError {
    /// The socket pattern that failed to bind.
    pub pattern: SocketPattern,
    /// The role, always [`SocketRole::Bind`] for this error.
    pub role: SocketRole,
    /// The port the caller asked to bind.
    pub port: u16,
    /// The underlying transport error.
    #[source]
    pub source: anyhow::Error,
}
