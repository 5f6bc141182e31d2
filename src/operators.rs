//! The chainable broadcast selector/emitter returned by `to`/`except`/…
//!
//! Each chained call returns a new, extended filter; nothing is mutated in
//! place. `except()` is kept only as an alias for [`Operators::except_room`]
//! — there is no heuristic that guesses whether a string argument means a
//! room or a socket id. Callers that mean a socket id must say so with
//! [`Operators::except_socket`].

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;

use crate::adapter::{Adapter, BroadcastOptions, Room};
use crate::ack::AckHandle;
use crate::error::{AdapterError, SendError};
use crate::id::SocketId;
use crate::namespace::Namespace;
use crate::packet::{ArgValue, Packet};
use crate::socket::Socket;

/// Types that can be used as a room parameter to `to`/`within`/`except`.
pub trait RoomParam {
    type IntoIter: Iterator<Item = Room>;
    fn into_room_iter(self) -> Self::IntoIter;
}

impl RoomParam for Room {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}
impl RoomParam for &str {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self.to_string())
    }
}
impl RoomParam for Vec<Room> {
    type IntoIter = std::vec::IntoIter<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}
impl<const N: usize> RoomParam for [&str; N] {
    type IntoIter = std::vec::IntoIter<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(|s| s.to_string()).collect_vec().into_iter()
    }
}

/// An immutable builder: each method returns a new `Operators` with the
/// filter extended. The terminal methods (`emit`, `emit_with_ack`,
/// `sockets`, `disconnect`, `join`, `leave`) resolve the filter via the
/// namespace's [`Adapter`].
pub struct Operators<A: Adapter> {
    opts: BroadcastOptions,
    ns: Arc<Namespace<A>>,
    binary: Vec<Vec<u8>>,
}

impl<A: Adapter> Operators<A> {
    pub(crate) fn new(ns: Arc<Namespace<A>>, origin: Option<SocketId>) -> Self {
        Self {
            opts: BroadcastOptions::new(origin),
            ns,
            binary: Vec::new(),
        }
    }

    /// Selects sockets in the given rooms, excluding the originating socket
    /// (if any). From the `Namespace` level (no origin) this is identical to
    /// [`Self::within`].
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter().unique());
        self.opts.exclude_origin = true;
        self
    }

    /// Selects sockets in the given rooms, including the originating socket.
    pub fn within(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter().unique());
        self
    }

    /// Excludes every member of the given rooms from the selection. This is
    /// the only `except` this type exposes; see [`Self::except_socket`] for
    /// excluding by socket id.
    pub fn except_room(mut self, rooms: impl RoomParam) -> Self {
        self.opts.except_rooms.extend(rooms.into_room_iter().unique());
        self
    }

    /// Alias for [`Self::except_room`], kept because most callers only ever
    /// except rooms.
    pub fn except(self, rooms: impl RoomParam) -> Self {
        self.except_room(rooms)
    }

    /// Excludes one specific socket from the selection, regardless of which
    /// rooms it belongs to.
    pub fn except_socket(mut self, sid: SocketId) -> Self {
        self.opts.except_sockets.push(sid);
        self
    }

    /// No-op on [`crate::adapter::LocalAdapter`]; reserved for a future
    /// distributed adapter that would otherwise fan out cross-process.
    pub fn local(mut self) -> Self {
        self.opts.flags.local = true;
        self
    }

    /// Marks the broadcast volatile: frames for it are dropped rather than
    /// back-pressuring when a target's outbound queue is full.
    pub fn volatile(mut self) -> Self {
        self.opts.flags.volatile = true;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.opts.flags.compress = compress;
        self
    }

    /// Overrides the default ack timeout for this emit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.opts.flags.timeout = Some(timeout);
        self
    }

    /// Attaches binary attachments to the event about to be emitted.
    pub fn bin(mut self, binary: Vec<Vec<u8>>) -> Self {
        self.binary = binary;
        self
    }

    /// Emits to every socket selected by the previous operators. Per-target
    /// send failures (a dead connection, a full queue) are logged rather
    /// than propagated.
    pub fn emit(mut self, event: impl Into<String>, data: impl serde::Serialize) -> Result<(), SendError> {
        let packet = self.build_packet(event, data)?;
        if let Err(e) = self.ns.broadcast(&packet, &self.opts) {
            tracing::debug!(error = %e, "broadcast error");
        }
        Ok(())
    }

    /// Emits and waits for acknowledgements from every selected socket,
    /// aggregated by the server-wide [`crate::ack::AckRegistry`].
    pub fn emit_with_ack(
        mut self,
        event: impl Into<String>,
        data: impl serde::Serialize,
    ) -> Result<AckHandle, SendError> {
        let packet = self.build_packet(event, data)?;
        let targets = self.ns.adapter().resolve_targets(&self.opts);
        let timeout = self.opts.flags.timeout.unwrap_or(self.ns.ack_timeout_default());
        let handle = self
            .ns
            .server_ack_registry()
            .register_broadcast(targets.clone(), timeout)
            .map_err(|_| SendError::AckTableFull)?;
        let packet_with_id = packet.with_ack_id(handle.id());
        if let Err(e) = self.ns.broadcast(&packet_with_id, &self.opts) {
            tracing::debug!(error = %e, "broadcast error");
        }
        Ok(handle)
    }

    pub fn sockets(self) -> Vec<Arc<Socket<A>>> {
        self.ns.fetch_sockets(&self.opts)
    }

    /// Disconnects every selected socket. `close` chooses between detaching
    /// just the namespace (`false`) and forcing the whole underlying
    /// transport connection closed (`true`), taking every other namespace
    /// socket on that connection down with it.
    pub fn disconnect(self, close: bool) -> Result<(), AdapterError> {
        for socket in self.ns.fetch_sockets(&self.opts) {
            if close {
                socket.close_transport_from_server()?;
            } else {
                socket.close_from_server()?;
            }
        }
        Ok(())
    }

    pub fn join(self, rooms: impl RoomParam) -> Result<(), A::Error> {
        let rooms: Vec<Room> = rooms.into_room_iter().collect();
        for socket in self.ns.fetch_sockets(&self.opts) {
            self.ns.adapter().add_all(socket.id, rooms.clone())?;
        }
        Ok(())
    }

    pub fn leave(self, rooms: impl RoomParam) -> Result<(), A::Error> {
        let rooms: Vec<Room> = rooms.into_room_iter().collect();
        for socket in self.ns.fetch_sockets(&self.opts) {
            self.ns.adapter().del(socket.id, rooms.clone())?;
        }
        Ok(())
    }

    fn build_packet(&mut self, event: impl Into<String>, data: impl serde::Serialize) -> Result<Packet, SendError> {
        let event = event.into();
        if crate::packet::is_reserved_event(&event) {
            return Err(SendError::ReservedEvent(event));
        }
        let value = serde_json::to_value(data)?;
        let mut args: Vec<ArgValue> = vec![ArgValue::Json(value)];
        if !self.binary.is_empty() {
            args.extend(std::mem::take(&mut self.binary).into_iter().map(ArgValue::Binary));
        }
        Ok(Packet::event(self.ns.path().to_string(), event, args))
    }
}
