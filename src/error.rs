//! Crate-wide error taxonomy.
//!
//! Split into a handful of small `thiserror` enums rather than one flat
//! enum: `SendError`, `AckError`, `DisconnectError` and `AdapterError` each
//! cover one concern.

use crate::id::SocketId;

/// Errors raised while decoding an inbound wire frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown packet type digit: {0}")]
    UnknownType(char),

    #[error("binary frame arrived with no pending binary packet")]
    UnexpectedAttachment,

    #[error("event name `{0}` is reserved")]
    ReservedEvent(String),
}

/// Stable, wire-observable reasons a [`crate::connection::Connection`] closes.
///
/// `Display` yields the exact reason string a client would see, so the
/// close path and any reporting share one source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ParseError,
    PingTimeout,
    TransportError,
    TransportClose,
    ServerShutdown,
    ForcedClose,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::ParseError => "parse error",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::TransportError => "transport error",
            CloseReason::TransportClose => "transport close",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::ForcedClose => "forced close",
        };
        f.write_str(s)
    }
}

/// Errors raised while sending a frame out through a [`crate::channel::MessageChannel`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("outbound queue is full")]
    QueueFull,

    #[error("the channel is closed")]
    Closed,

    #[error("`{0}` is a reserved event name and cannot be emitted")]
    ReservedEvent(String),

    #[error("the ack table is full")]
    AckTableFull,
}

/// Errors surfaced through an acknowledgement callback.
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("no acknowledgement received within the deadline")]
    Timeout,

    #[error("socket {0} disconnected before acknowledging")]
    Aborted(SocketId),

    #[error("failed to deserialize acknowledgement payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to send the request: {0}")]
    Send(#[from] SendError),

    #[error("the ack table is full")]
    TableFull,
}

/// Errors raised by the [`crate::adapter::Adapter`] / broadcast path.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("socket {0} is not attached to this namespace")]
    UnknownSocket(SocketId),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Errors raised while running a namespace's middleware chain.
#[derive(Debug, thiserror::Error)]
#[error("namespace middleware rejected the connection: {message}")]
pub struct NamespaceError {
    pub message: String,
}

impl NamespaceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors raised when disconnecting a socket.
#[derive(Debug, thiserror::Error)]
pub enum DisconnectError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}
