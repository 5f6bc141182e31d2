//! `wireio` — the core of a Socket.IO v5 compatible real-time event server:
//! the wire-protocol codec, the per-connection lifecycle state machine, the
//! room/namespace adapter with broadcast fan-out, and the acknowledgement
//! correlation subsystem.
//!
//! This crate does not include a transport. Callers provide a
//! [`channel::MessageChannel`] implementation (a WebSocket, an in-process
//! test double, …) and hand it to [`server::Server::accept`]; the socket
//! handles returned through [`namespace::Namespace::on_connection`] are the
//! whole public surface needed to register event listeners and broadcast.

pub mod ack;
pub mod adapter;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod handshake;
pub mod id;
pub mod namespace;
pub mod operators;
pub mod packet;
pub mod server;
pub mod socket;

pub use adapter::{Adapter, LocalAdapter, Room};
pub use ack::{AckResponse, BroadcastOutcome};
pub use config::ServerConfig;
pub use error::{AckError, AdapterError, CloseReason, DecodeError, NamespaceError, SendError};
pub use handshake::Handshake;
pub use id::{SessionId, SocketId};
pub use namespace::Namespace;
pub use packet::{ArgValue, Packet};
pub use server::Server;
pub use socket::{DisconnectReason, Socket};
