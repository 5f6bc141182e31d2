//! A [`Socket`] represents one client attached to one namespace.
//!
//! It owns a message handler registry, a single disconnect handler, and
//! `on`/`emit`/`emit_with_ack` plus the room operators (`to`/`within`/
//! `broadcast`/…). The socket writes through an [`OutboundHandle`] onto the
//! owning connection's outbound queue rather than a concrete transport
//! directly. ACK correlation is delegated to the server-wide
//! [`AckRegistry`] rather than a per-socket counter, since a broadcast ack's
//! responses can arrive over any connection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::ack::{AckRegistry, AckResponse};
use crate::adapter::{Adapter, Room};
use crate::error::{AckError, AdapterError, SendError};
use crate::extensions::Extensions;
use crate::handshake::Handshake;
use crate::id::SocketId;
use crate::namespace::Namespace;
use crate::operators::{Operators, RoomParam};
use crate::packet::{is_reserved_event, ArgValue, Packet, PacketData};

/// Why a [`Socket`] left its namespace — the wire-observable reasons this
/// crate's taxonomy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    TransportClose,
    TransportError,
    PingTimeout,
    PacketParsingError,
    ClientNamespaceDisconnect,
    ServerNamespaceDisconnect,
    ServerShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::TransportClose => "client gracefully closed the connection",
            DisconnectReason::TransportError => "the connection was abruptly closed",
            DisconnectReason::PingTimeout => "client did not send a PONG packet in time",
            DisconnectReason::PacketParsingError => "client sent a bad request",
            DisconnectReason::ClientNamespaceDisconnect => "client namespace disconnect",
            DisconnectReason::ServerNamespaceDisconnect => "server namespace disconnect",
            DisconnectReason::ServerShutdown => "server is shutting down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    Attaching = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for SocketState {
    fn from(v: u8) -> Self {
        match v {
            0 => SocketState::Attaching,
            1 => SocketState::Open,
            2 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

type MessageHandler<A> = Box<dyn Fn(Arc<Socket<A>>, Value, Vec<Vec<u8>>, Option<i64>) + Send + Sync>;
type DisconnectHandler<A> = Box<dyn FnOnce(Arc<Socket<A>>, DisconnectReason) + Send + Sync>;

/// Anything a [`Socket`] needs from its owning connection in order to write
/// frames out. Kept minimal and object-safe so `Socket` doesn't need to know
/// about the connection's read loop, heartbeat, or transport type.
pub trait OutboundHandle: Send + Sync {
    fn send(&self, packet: Packet, volatile: bool) -> Result<(), SendError>;

    /// Forces the owning connection closed, detaching every namespace socket
    /// attached to it — not just this one.
    fn close_transport(&self);
}

pub struct Socket<A: Adapter = crate::adapter::LocalAdapter> {
    pub id: SocketId,
    pub handshake: Handshake,
    pub data: Extensions,
    ns: Arc<Namespace<A>>,
    outbound: Arc<dyn OutboundHandle>,
    ack_registry: Arc<AckRegistry>,
    ack_timeout_default: Duration,
    state: AtomicU8,
    message_handlers: RwLock<HashMap<String, MessageHandler<A>>>,
    disconnect_handler: Mutex<Option<DisconnectHandler<A>>>,
    /// ACK ids already answered by this socket, so a second attempt to
    /// answer the same inbound request is a no-op.
    sent_acks: Mutex<HashSet<i64>>,
}

impl<A: Adapter> Socket<A> {
    pub(crate) fn new(
        id: SocketId,
        ns: Arc<Namespace<A>>,
        handshake: Handshake,
        outbound: Arc<dyn OutboundHandle>,
        ack_registry: Arc<AckRegistry>,
        ack_timeout_default: Duration,
    ) -> Self {
        Self {
            id,
            handshake,
            data: Extensions::new(),
            ns,
            outbound,
            ack_registry,
            ack_timeout_default,
            state: AtomicU8::new(SocketState::Attaching as u8),
            message_handlers: RwLock::new(HashMap::new()),
            disconnect_handler: Mutex::new(None),
            sent_acks: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> SocketState {
        self.state.load(Ordering::Acquire).into()
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn ns(&self) -> &str {
        self.ns.path()
    }

    /// Registers a listener for `event`. Reserved names are rejected outright
    /// since no inbound EVENT can ever carry them past the codec.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Socket<A>>, Value, Vec<Vec<u8>>, Option<i64>) + Send + Sync + 'static,
    {
        let event = event.into();
        if is_reserved_event(&event) {
            tracing::warn!(event, "ignoring handler registration for reserved event");
            return;
        }
        self.message_handlers.write().unwrap().insert(event, Box::new(handler));
    }

    /// Registers the (single) disconnect handler. A later call replaces an
    /// earlier one; only the last registration is used.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: FnOnce(Arc<Socket<A>>, DisconnectReason) + Send + Sync + 'static,
    {
        self.disconnect_handler.lock().unwrap().replace(Box::new(handler));
    }

    pub fn emit(&self, event: impl Into<String>, data: impl Serialize) -> Result<(), SendError> {
        let event = event.into();
        if is_reserved_event(&event) {
            return Err(SendError::ReservedEvent(event));
        }
        let value = serde_json::to_value(data)?;
        let packet = Packet::event(self.ns.path().to_string(), event, vec![ArgValue::Json(value)]);
        self.send_raw(packet, false)
    }

    /// Emits with a binary payload attached.
    pub fn emit_binary(
        &self,
        event: impl Into<String>,
        data: impl Serialize,
        binary: Vec<Vec<u8>>,
    ) -> Result<(), SendError> {
        let event = event.into();
        if is_reserved_event(&event) {
            return Err(SendError::ReservedEvent(event));
        }
        let value = serde_json::to_value(data)?;
        let mut args = vec![ArgValue::Json(value)];
        args.extend(binary.into_iter().map(ArgValue::Binary));
        let packet = Packet::event(self.ns.path().to_string(), event, args);
        self.send_raw(packet, false)
    }

    /// Emits and waits for the client's acknowledgement, using the server's
    /// default ack timeout.
    pub async fn emit_with_ack(
        &self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<AckResponse, AckError> {
        let event = event.into();
        if is_reserved_event(&event) {
            return Err(SendError::ReservedEvent(event).into());
        }
        let value = serde_json::to_value(data)?;
        let packet = Packet::event(self.ns.path().to_string(), event, vec![ArgValue::Json(value)]);
        let (id, rx) = self.ack_registry.register_single(self.ack_timeout_default)?;
        self.send_raw(packet.with_ack_id(id), false)?;
        rx.await.unwrap_or(Err(AckError::Timeout))
    }

    /// Answers an inbound EVENT's `ackID`. A second call for the same
    /// `ack_id` is a no-op (logged as a double-ack attempt) rather than
    /// sending a duplicate ACK frame.
    pub fn ack(&self, ack_id: i64, data: impl Serialize) -> Result<(), SendError> {
        if !self.sent_acks.lock().unwrap().insert(ack_id) {
            tracing::warn!(ack_id, "duplicate ack response ignored");
            return Ok(());
        }
        let value = serde_json::to_value(data)?;
        let packet = Packet::ack(self.ns.path().to_string(), ack_id, vec![ArgValue::Json(value)]);
        self.send_raw(packet, false)
    }

    // Room actions, delegated straight to the namespace's adapter.

    pub fn join(&self, rooms: impl RoomParam) -> Result<(), A::Error> {
        self.ns.adapter().add_all(self.id, rooms.into_room_iter().collect())?;
        Ok(())
    }

    pub fn leave(&self, rooms: impl RoomParam) -> Result<(), A::Error> {
        self.ns.adapter().del(self.id, rooms.into_room_iter().collect())?;
        Ok(())
    }

    pub fn leave_all(&self) -> Result<(), A::Error> {
        self.ns.adapter().del_all(self.id)?;
        Ok(())
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.ns.adapter().socket_rooms(self.id)
    }

    // Broadcast operators: shortcuts for `Operators::new(ns, Some(id))`.

    pub fn to(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id)).to(rooms)
    }

    pub fn within(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id)).within(rooms)
    }

    pub fn except_room(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id)).except_room(rooms)
    }

    pub fn local(&self) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id)).local()
    }

    pub fn timeout(&self, timeout: Duration) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id)).timeout(timeout)
    }

    pub fn bin(&self, binary: Vec<Vec<u8>>) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id)).bin(binary)
    }

    /// Broadcasts to every other socket in the namespace.
    pub fn broadcast(&self) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id)).to(Vec::<Room>::new())
    }

    /// Disconnects this socket from its namespace and notifies the client.
    pub fn disconnect(self: Arc<Self>) -> Result<(), crate::error::DisconnectError> {
        self.send_raw(Packet::disconnect(self.ns.path()), false)?;
        self.close(DisconnectReason::ServerNamespaceDisconnect)?;
        Ok(())
    }

    pub(crate) fn close_from_server(self: &Arc<Self>) -> Result<(), AdapterError> {
        self.clone().disconnect().map_err(|e| match e {
            crate::error::DisconnectError::Adapter(a) => a,
            crate::error::DisconnectError::Send(s) => AdapterError::Send(s),
        })
    }

    /// Disconnects this socket and forces the underlying transport
    /// connection closed, taking every other namespace socket on it down
    /// with it — the `disconnect(true)` shape, as opposed to the
    /// namespace-only [`Socket::close_from_server`].
    pub(crate) fn close_transport_from_server(self: &Arc<Self>) -> Result<(), AdapterError> {
        self.outbound.close_transport();
        self.close_from_server()
    }

    pub(crate) fn send_raw(&self, packet: Packet, volatile: bool) -> Result<(), SendError> {
        self.outbound.send(packet, volatile)
    }

    /// Runs the disconnect handler (if any), removes this socket from its
    /// namespace, and tells the server's ack registry this socket will never
    /// answer any broadcast ack still waiting on it.
    pub(crate) fn close(self: &Arc<Self>, reason: DisconnectReason) -> Result<(), crate::error::AdapterError> {
        self.set_state(SocketState::Closing);
        if let Some(handler) = self.disconnect_handler.lock().unwrap().take() {
            handler(self.clone(), reason);
        }
        self.ack_registry.socket_gone(self.id);
        self.ns.remove_socket(self.id)?;
        self.set_state(SocketState::Closed);
        Ok(())
    }

    /// Dispatches one decoded inbound packet addressed to this socket.
    pub(crate) fn recv(self: &Arc<Self>, packet: PacketData, ack_id: Option<i64>) {
        match packet {
            PacketData::Event(ev) => self.recv_event(ev.event, Value::Array(ev.args), Vec::new(), ack_id),
            PacketData::BinaryEvent(ev, bin) => {
                self.recv_event(ev.event, Value::Array(ev.args), bin, ack_id)
            }
            PacketData::Disconnect => {
                let _ = self.close(DisconnectReason::ClientNamespaceDisconnect);
            }
            PacketData::Ack(_) | PacketData::BinaryAck(_, _) => {
                unreachable!("ack packets are resolved by the connection before reaching recv")
            }
            PacketData::Connect(_) | PacketData::ConnectError(_) => {}
        }
    }

    fn recv_event(self: &Arc<Self>, event: String, args: Value, bin: Vec<Vec<u8>>, ack_id: Option<i64>) {
        let handlers = self.message_handlers.read().unwrap();
        if let Some(handler) = handlers.get(&event) {
            handler(self.clone(), args, bin, ack_id);
        } else {
            tracing::debug!(event, "no handler registered for event");
        }
    }
}

impl<A: Adapter> fmt::Debug for Socket<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("ns", &self.ns())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct RecordingOutbound {
        pub sent: Mutex<Vec<(Packet, bool)>>,
        pub fail: bool,
        pub transport_closed: std::sync::atomic::AtomicBool,
    }

    impl RecordingOutbound {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: false,
                transport_closed: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl OutboundHandle for RecordingOutbound {
        fn send(&self, packet: Packet, volatile: bool) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError::QueueFull);
            }
            self.sent.lock().unwrap().push((packet, volatile));
            Ok(())
        }

        fn close_transport(&self) {
            self.transport_closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::RecordingOutbound;
    use super::*;
    use crate::adapter::LocalAdapter;
    use serde_json::json;

    fn dummy_socket() -> (Arc<Socket<LocalAdapter>>, Arc<RecordingOutbound>) {
        let ns = Namespace::new_dummy("/");
        let outbound = RecordingOutbound::new();
        let registry = AckRegistry::new(100);
        let socket = Arc::new(Socket::new(
            SocketId::new(),
            ns,
            Handshake::new("127.0.0.1", "/", Value::Null),
            outbound.clone(),
            registry,
            Duration::from_secs(1),
        ));
        (socket, outbound)
    }

    #[test]
    fn emit_rejects_reserved_event_names() {
        let (socket, _out) = dummy_socket();
        let err = socket.emit("disconnect", json!(null)).unwrap_err();
        assert!(matches!(err, SendError::ReservedEvent(_)));
    }

    #[test]
    fn emit_enqueues_an_event_packet() {
        let (socket, out) = dummy_socket();
        socket.emit("hello", json!("world")).unwrap();
        let sent = out.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0].0.inner {
            PacketData::Event(ev) => assert_eq!(ev.event, "hello"),
            _ => panic!("expected event packet"),
        }
    }

    #[test]
    fn duplicate_ack_response_is_a_no_op() {
        let (socket, out) = dummy_socket();
        socket.ack(7, json!(1)).unwrap();
        socket.ack(7, json!(2)).unwrap();
        assert_eq!(out.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn on_disconnect_handler_runs_once() {
        let (socket, _out) = dummy_socket();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        socket.on_disconnect(move |_s, reason| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(reason);
            }
        });
        socket.close(DisconnectReason::ClientNamespaceDisconnect).unwrap();
        let reason = rx.await.unwrap();
        assert_eq!(reason, DisconnectReason::ClientNamespaceDisconnect);
    }
}
