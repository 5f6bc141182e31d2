//! The abstract duplex transport the core runs on top of.
//!
//! The concrete WebSocket transport and the HTTP upgrade that produces it
//! are out of scope for this crate — callers hand the
//! [`Connection`](crate::connection::Connection) anything that implements
//! [`MessageChannel`].

use std::fmt;

/// One frame of the underlying transport: either a text frame (a Socket.IO
/// packet header, possibly followed by JSON) or a binary frame (an
/// attachment payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

/// Result of a non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The frame was handed to the transport.
    Accepted,
    /// The transport's internal buffer is saturated; try again later.
    WouldBlock,
}

/// A code/reason pair passed to [`MessageChannel::close`].
#[derive(Debug, Clone)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// An error produced by the transport itself (as opposed to a protocol
/// error produced by the codec).
#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// The duplex byte/text-frame transport a [`Connection`](crate::connection::Connection)
/// drives. Implemented by whatever sits below the core (a WebSocket
/// library, a test double, …).
#[async_trait::async_trait]
pub trait MessageChannel: Send + Sync {
    /// Reads the next frame. Returns `Ok(None)` when the peer has closed the
    /// channel cleanly.
    async fn read(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Attempts to write a frame without blocking.
    fn write(&self, frame: Frame) -> Result<WriteOutcome, TransportError>;

    /// Closes the channel with the given code/reason. Idempotent.
    fn close(&self, info: CloseInfo);

    fn remote_address(&self) -> String;

    fn local_address(&self) -> String;

    /// Whether the transport-level connection is secure (e.g. wss://).
    fn is_secure(&self) -> bool {
        false
    }
}
