//! A named scope that owns a socket pool, a middleware chain, and an
//! [`Adapter`].
//!
//! The middleware chain runs left-to-right at attach time, and the socket
//! pool is a plain `RwLock<HashMap<...>>` keyed by socket id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::ack::{AckHandle, AckRegistry};
use crate::adapter::{Adapter, BroadcastOptions};
use crate::config::ServerConfig;
use crate::error::{AdapterError, NamespaceError, SendError};
use crate::handshake::Handshake;
use crate::id::SocketId;
use crate::operators::{Operators, RoomParam};
use crate::packet::Packet;
use crate::socket::{OutboundHandle, Socket, SocketState};

type Middleware = Box<dyn Fn(&Handshake) -> Result<(), NamespaceError> + Send + Sync>;
type ConnectHandler<A> = Box<dyn Fn(Arc<Socket<A>>) + Send + Sync>;

pub struct Namespace<A: Adapter = crate::adapter::LocalAdapter> {
    path: String,
    adapter: A,
    sockets: RwLock<HashMap<SocketId, Arc<Socket<A>>>>,
    middlewares: RwLock<Vec<Middleware>>,
    connect_handlers: RwLock<Vec<ConnectHandler<A>>>,
    ack_registry: Arc<AckRegistry>,
    config: Arc<ServerConfig>,
}

impl<A: Adapter> Namespace<A> {
    pub(crate) fn new(
        path: impl Into<String>,
        adapter: A,
        ack_registry: Arc<AckRegistry>,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            adapter,
            sockets: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            connect_handlers: RwLock::new(Vec::new()),
            ack_registry,
            config,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub(crate) fn server_ack_registry(&self) -> Arc<AckRegistry> {
        self.ack_registry.clone()
    }

    pub(crate) fn ack_timeout_default(&self) -> Duration {
        self.config.ack_timeout_default
    }

    /// Appends a middleware to the chain run at attach time. Middlewares run
    /// in registration order; the first one to return `Err` aborts the
    /// attach.
    pub fn use_middleware<F>(&self, f: F)
    where
        F: Fn(&Handshake) -> Result<(), NamespaceError> + Send + Sync + 'static,
    {
        self.middlewares.write().unwrap().push(Box::new(f));
    }

    /// Registers a handler invoked once a socket has successfully attached.
    pub fn on_connection<F>(&self, f: F)
    where
        F: Fn(Arc<Socket<A>>) + Send + Sync + 'static,
    {
        self.connect_handlers.write().unwrap().push(Box::new(f));
    }

    /// Runs the middleware chain for `handshake`, and on success creates and
    /// registers a new [`Socket`], joins its self-room, and fires the
    /// connection handlers.
    pub(crate) fn attach(
        self: &Arc<Self>,
        handshake: Handshake,
        outbound: Arc<dyn OutboundHandle>,
    ) -> Result<Arc<Socket<A>>, NamespaceError> {
        for middleware in self.middlewares.read().unwrap().iter() {
            middleware(&handshake)?;
        }

        let id = SocketId::new();
        let socket = Arc::new(Socket::new(
            id,
            self.clone(),
            handshake,
            outbound,
            self.ack_registry.clone(),
            self.config.ack_timeout_default,
        ));
        socket.set_state(SocketState::Open);

        if let Err(e) = self.adapter.add_all(id, vec![id.to_string()]) {
            tracing::warn!(error = %e, "failed to join self-room on attach");
        }
        self.sockets.write().unwrap().insert(id, socket.clone());

        for handler in self.connect_handlers.read().unwrap().iter() {
            handler(socket.clone());
        }
        Ok(socket)
    }

    pub fn get_socket(&self, id: SocketId) -> Option<Arc<Socket<A>>> {
        self.sockets.read().unwrap().get(&id).cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.read().unwrap().len()
    }

    /// Removes a socket from the pool. Adapter cleanup is best-effort and
    /// logged rather than propagated: once a socket is gone, its room
    /// memberships are stale bookkeeping, not something a caller can act on.
    pub(crate) fn remove_socket(&self, id: SocketId) -> Result<(), AdapterError> {
        if let Err(e) = self.adapter.del_all(id) {
            tracing::warn!(error = %e, "adapter cleanup failed during socket removal");
        }
        self.sockets.write().unwrap().remove(&id);
        Ok(())
    }

    /// Starts a broadcast chain with no originating socket — the
    /// `io.of(path).to(room)` shape, as opposed to a socket's own
    /// `socket.to(room)`.
    pub fn to(self: &Arc<Self>, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.clone(), None).to(rooms)
    }

    pub fn within(self: &Arc<Self>, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.clone(), None).within(rooms)
    }

    /// Emits to every socket currently attached to this namespace.
    pub fn emit(self: &Arc<Self>, event: impl Into<String>, data: impl serde::Serialize) -> Result<(), SendError> {
        Operators::new(self.clone(), None).emit(event, data)
    }

    /// Emits to every attached socket and waits for each to acknowledge.
    pub fn emit_with_ack(
        self: &Arc<Self>,
        event: impl Into<String>,
        data: impl serde::Serialize,
    ) -> Result<AckHandle, SendError> {
        Operators::new(self.clone(), None).emit_with_ack(event, data)
    }

    /// Adds every attached socket to `rooms`.
    pub fn sockets_join(self: &Arc<Self>, rooms: impl RoomParam) -> Result<(), A::Error> {
        Operators::new(self.clone(), None).join(rooms)
    }

    /// Removes every attached socket from `rooms`.
    pub fn sockets_leave(self: &Arc<Self>, rooms: impl RoomParam) -> Result<(), A::Error> {
        Operators::new(self.clone(), None).leave(rooms)
    }

    /// Disconnects every attached socket. `close` chooses between detaching
    /// just this namespace (`false`) and force-closing the underlying
    /// transport connection outright (`true`).
    pub fn disconnect_sockets(self: &Arc<Self>, close: bool) -> Result<(), AdapterError> {
        Operators::new(self.clone(), None).disconnect(close)
    }

    pub fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<Arc<Socket<A>>> {
        let targets = self.adapter.resolve_targets(opts);
        let sockets = self.sockets.read().unwrap();
        targets.into_iter().filter_map(|id| sockets.get(&id).cloned()).collect()
    }

    pub(crate) fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) -> Result<(), AdapterError> {
        let sockets = self.sockets.read().unwrap();
        crate::adapter::broadcast(&self.adapter, packet, opts, |id| sockets.get(&id).cloned())
    }
}

#[cfg(test)]
impl Namespace<crate::adapter::LocalAdapter> {
    pub(crate) fn new_dummy(path: &str) -> Arc<Self> {
        Namespace::new(
            path,
            crate::adapter::LocalAdapter::new(),
            AckRegistry::new(100),
            Arc::new(ServerConfig::default()),
        )
    }
}
