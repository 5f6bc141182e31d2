//! The per-channel state machine: handshake, heartbeat, and inbound/outbound
//! framing for one attached transport.
//!
//! This module owns the transport-facing half of a connection — heartbeat,
//! handshake, and frame I/O — while [`crate::socket::Socket`] owns
//! per-namespace state. The concrete WebSocket/engine.io implementation is
//! not provided; only the abstract [`MessageChannel`] is given.
//!
//! Control frames (the out-of-band HANDSHAKE, PING/PONG) are not part of the
//! Socket.IO v5 packet grammar the [`crate::packet`] codec implements — that
//! framing belongs to the engine.io layer this crate does not model. They're
//! represented here as text frames carrying an `H` prefix the packet decoder
//! never produces, so a single [`MessageChannel`] can carry both without
//! ambiguity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::ack::AckResponse;
use crate::adapter::Adapter;
use crate::channel::{CloseInfo, Frame, MessageChannel, WriteOutcome};
use crate::config::ServerConfig;
use crate::error::{CloseReason, SendError};
use crate::handshake::Handshake;
use crate::id::SessionId;
use crate::namespace::Namespace;
use crate::packet::{DecodeOutcome, Decoder, Packet, PacketData};
use crate::server::Server;
use crate::socket::{DisconnectReason, OutboundHandle, Socket};

const CONTROL_PREFIX: char = 'H';

/// Result of handling one inbound frame: either the connection stays open,
/// or it must close with the given reason.
enum FrameOutcome {
    Ok,
    Close(CloseReason),
}

fn close_reason_to_disconnect_reason(reason: CloseReason) -> DisconnectReason {
    match reason {
        CloseReason::ParseError => DisconnectReason::PacketParsingError,
        CloseReason::PingTimeout => DisconnectReason::PingTimeout,
        CloseReason::TransportError => DisconnectReason::TransportError,
        CloseReason::TransportClose => DisconnectReason::TransportClose,
        CloseReason::ServerShutdown => DisconnectReason::ServerShutdown,
        CloseReason::ForcedClose => DisconnectReason::ServerNamespaceDisconnect,
    }
}

struct ConnectionOutbound {
    tx: mpsc::Sender<(Vec<Frame>, bool)>,
    force_close_tx: mpsc::Sender<()>,
}

impl OutboundHandle for ConnectionOutbound {
    fn send(&self, packet: Packet, volatile: bool) -> Result<(), SendError> {
        let frames = packet.encode();
        match self.tx.try_send((frames, volatile)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) if volatile => {
                tracing::debug!("dropping volatile frame: outbound queue full");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    fn close_transport(&self) {
        let _ = self.force_close_tx.try_send(());
    }
}

/// Owns one [`MessageChannel`] and every [`Socket`] attached to it across
/// namespaces. There is exactly one reader and one writer of `channel`: this
/// struct, driven by [`Connection::run`].
pub struct Connection<A: Adapter + Default = crate::adapter::LocalAdapter> {
    pub id: SessionId,
    server: Arc<Server<A>>,
    channel: Box<dyn MessageChannel>,
    decoder: Decoder,
    sockets: HashMap<String, Arc<Socket<A>>>,
    outbound_tx: mpsc::Sender<(Vec<Frame>, bool)>,
    outbound_rx: mpsc::Receiver<(Vec<Frame>, bool)>,
    force_close_tx: mpsc::Sender<()>,
    force_close_rx: mpsc::Receiver<()>,
    config: Arc<ServerConfig>,
}

impl<A: Adapter + Default> Connection<A> {
    pub(crate) fn new(id: SessionId, server: Arc<Server<A>>, channel: Box<dyn MessageChannel>) -> Self {
        let config = server.config_arc();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.per_connection_outbound_queue);
        let (force_close_tx, force_close_rx) = mpsc::channel(1);
        Self {
            id,
            server,
            channel,
            decoder: Decoder::new(),
            sockets: HashMap::new(),
            outbound_tx,
            outbound_rx,
            force_close_tx,
            force_close_rx,
            config,
        }
    }

    fn outbound_handle(&self) -> Arc<dyn OutboundHandle> {
        Arc::new(ConnectionOutbound {
            tx: self.outbound_tx.clone(),
            force_close_tx: self.force_close_tx.clone(),
        })
    }

    /// Drives this connection until it closes. Consumes `self`: once this
    /// future resolves, the channel and every attached socket are gone.
    pub async fn run(mut self) {
        self.write_control("open", Some(self.handshake_payload()));

        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.tick().await; // first tick fires immediately; consume it
        let mut awaiting_pong = false;
        // Armed the moment a PING goes out; disarmed (via the `if awaiting_pong`
        // guard below) whenever the client has already been heard from. Its
        // reset deadline, not the next `ping_timer` tick, is what actually
        // bounds detection to `ping_timeout` rather than `ping_interval`.
        let pong_deadline = tokio::time::sleep(self.config.ping_timeout);
        tokio::pin!(pong_deadline);
        let connect_deadline = tokio::time::sleep(self.config.connect_timeout);
        tokio::pin!(connect_deadline);
        let mut default_ns_attached = false;

        loop {
            tokio::select! {
                frame = self.channel.read() => {
                    match frame {
                        Ok(Some(f)) => {
                            awaiting_pong = false;
                            match self.handle_frame(f) {
                                FrameOutcome::Ok => {}
                                FrameOutcome::Close(reason) => return self.shutdown(reason).await,
                            }
                            default_ns_attached = self.sockets.contains_key("/");
                        }
                        Ok(None) => return self.shutdown(CloseReason::TransportClose).await,
                        Err(_) => return self.shutdown(CloseReason::TransportError).await,
                    }
                }
                frame = self.outbound_rx.recv() => {
                    match frame {
                        Some((frames, _volatile)) => self.write_frames(frames),
                        None => return self.shutdown(CloseReason::TransportError).await,
                    }
                }
                _ = self.force_close_rx.recv() => {
                    return self.shutdown(CloseReason::ForcedClose).await;
                }
                _ = ping_timer.tick() => {
                    self.write_control("ping", None);
                    pong_deadline.as_mut().reset(tokio::time::Instant::now() + self.config.ping_timeout);
                    awaiting_pong = true;
                }
                _ = &mut pong_deadline, if awaiting_pong => {
                    return self.shutdown(CloseReason::PingTimeout).await;
                }
                _ = &mut connect_deadline, if !default_ns_attached => {
                    return self.shutdown(CloseReason::TransportClose).await;
                }
            }
        }
    }

    fn handshake_payload(&self) -> Value {
        json!({
            "sid": self.id.to_string(),
            "pingInterval": self.config.ping_interval.as_millis(),
            "pingTimeout": self.config.ping_timeout.as_millis(),
            "maxPayload": self.config.max_payload,
        })
    }

    /// Closes when the frame was malformed (parse error) or a connect to the
    /// default namespace was rejected; otherwise keeps the connection open,
    /// including for handled control frames and packets that pend on more
    /// attachments.
    fn handle_frame(&mut self, frame: Frame) -> FrameOutcome {
        if let Frame::Text(text) = &frame {
            if let Some(rest) = text.strip_prefix(CONTROL_PREFIX) {
                if rest == "pong" {
                    tracing::trace!(id = %self.id, "pong received");
                }
                return FrameOutcome::Ok;
            }
        }
        match self.decoder.decode(frame) {
            Ok(DecodeOutcome::Pending) => FrameOutcome::Ok,
            Ok(DecodeOutcome::Complete(packet)) => self.dispatch(packet),
            Err(e) => {
                tracing::debug!(id = %self.id, error = %e, "dropping connection on decode error");
                FrameOutcome::Close(CloseReason::ParseError)
            }
        }
    }

    fn dispatch(&mut self, packet: Packet) -> FrameOutcome {
        match packet.inner {
            PacketData::Connect(auth) => return self.handle_connect(packet.ns, auth),
            PacketData::Disconnect => {
                if let Some(socket) = self.sockets.remove(&packet.ns) {
                    let _ = socket.close(DisconnectReason::ClientNamespaceDisconnect);
                }
            }
            PacketData::Ack(args) => self.handle_ack(&packet.ns, packet.ack_id, args, Vec::new()),
            PacketData::BinaryAck(args, bin) => self.handle_ack(&packet.ns, packet.ack_id, args, bin),
            inner @ (PacketData::Event(_) | PacketData::BinaryEvent(_, _)) => {
                match self.sockets.get(&packet.ns) {
                    Some(socket) => socket.clone().recv(inner, packet.ack_id),
                    None => tracing::debug!(ns = %packet.ns, "event for unattached namespace dropped"),
                }
            }
            PacketData::ConnectError(_) => {}
        }
        FrameOutcome::Ok
    }

    /// Attaches to `ns`, or on middleware rejection sends `CONNECT_ERROR` and,
    /// if `ns` is the default namespace, closes the connection outright —
    /// there is no namespace left for the client to fall back to.
    fn handle_connect(&mut self, ns: String, auth: Option<Value>) -> FrameOutcome {
        let namespace: Arc<Namespace<A>> = self.server.of(ns.clone());
        let handshake = Handshake::new(self.channel.remote_address(), ns.clone(), auth.unwrap_or(Value::Null))
            .with_secure(self.channel.is_secure());
        let outbound = self.outbound_handle();
        match namespace.attach(handshake, outbound) {
            Ok(socket) => {
                self.write_packet(Packet::connect(ns.clone(), Some(json!({ "sid": socket.id.to_string() }))));
                self.sockets.insert(ns, socket);
                FrameOutcome::Ok
            }
            Err(e) => {
                tracing::debug!(ns = %ns, error = %e, "namespace middleware rejected attach");
                self.write_packet(Packet::connect_error(ns.clone(), e.message));
                if ns == "/" {
                    FrameOutcome::Close(CloseReason::ForcedClose)
                } else {
                    FrameOutcome::Ok
                }
            }
        }
    }

    fn handle_ack(&self, ns: &str, ack_id: Option<i64>, args: Vec<Value>, binary: Vec<Vec<u8>>) {
        let Some(id) = ack_id else {
            tracing::debug!("ack packet without an id dropped");
            return;
        };
        let Some(socket) = self.sockets.get(ns) else {
            tracing::debug!(ns, "ack for unattached namespace dropped");
            return;
        };
        let namespace = self.server.of(ns.to_string());
        namespace.server_ack_registry().resolve(id, socket.id, AckResponse { args, binary });
    }

    fn write_packet(&self, packet: Packet) {
        self.write_frames(packet.encode());
    }

    fn write_control(&self, kind: &str, payload: Option<Value>) {
        let text = match payload {
            Some(v) => format!("{CONTROL_PREFIX}{kind}{v}"),
            None => format!("{CONTROL_PREFIX}{kind}"),
        };
        self.write_frame_now(Frame::Text(text));
    }

    fn write_frames(&self, frames: Vec<Frame>) {
        for frame in frames {
            self.write_frame_now(frame);
        }
    }

    fn write_frame_now(&self, frame: Frame) {
        match self.channel.write(frame) {
            Ok(WriteOutcome::Accepted) => {}
            Ok(WriteOutcome::WouldBlock) => {
                tracing::warn!(id = %self.id, "transport backpressure, dropping frame");
            }
            Err(e) => tracing::warn!(id = %self.id, error = %e, "transport write failed"),
        }
    }

    /// Detaches every attached socket, drains the outbound queue up to
    /// `closeGrace`, then force-closes the channel.
    async fn shutdown(mut self, reason: CloseReason) {
        tracing::debug!(id = %self.id, %reason, "closing connection");
        let disconnect_reason = close_reason_to_disconnect_reason(reason);
        for (_, socket) in self.sockets.drain() {
            let _ = socket.close(disconnect_reason);
        }
        self.drain_outbound_with_grace().await;
        self.channel.close(CloseInfo::new(1000, reason.to_string()));
    }

    async fn drain_outbound_with_grace(&mut self) {
        let deadline = tokio::time::sleep(self.config.close_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                frame = self.outbound_rx.recv() => {
                    match frame {
                        Some((frames, _)) => self.write_frames(frames),
                        None => return,
                    }
                }
                _ = &mut deadline => return,
            }
        }
    }
}
