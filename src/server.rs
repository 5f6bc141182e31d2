//! Owns every [`Namespace`] and accepts new [`MessageChannel`]s.
//!
//! A namespace registry behind a single lock, get-or-create semantics on
//! [`Server::of`], and one server-wide [`AckRegistry`] shared by every
//! namespace.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::ack::AckRegistry;
use crate::adapter::Adapter;
use crate::channel::MessageChannel;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::id::SessionId;
use crate::namespace::Namespace;

pub struct Server<A: Adapter + Default = crate::adapter::LocalAdapter> {
    config: Arc<ServerConfig>,
    ack_registry: Arc<AckRegistry>,
    namespaces: RwLock<HashMap<String, Arc<Namespace<A>>>>,
}

impl<A: Adapter + Default> Server<A> {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let ack_registry = AckRegistry::new(config.max_ack_table_size);
        let this = Arc::new(Self {
            config: Arc::new(config),
            ack_registry,
            namespaces: RwLock::new(HashMap::new()),
        });
        this.of("/");
        this
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn config_arc(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    /// Returns the namespace at `path`, creating it (with a fresh adapter)
    /// if this is the first reference to it.
    pub fn of(self: &Arc<Self>, path: impl Into<String>) -> Arc<Namespace<A>> {
        let path = path.into();
        if let Some(ns) = self.namespaces.read().unwrap().get(&path) {
            return ns.clone();
        }
        self.namespaces
            .write()
            .unwrap()
            .entry(path.clone())
            .or_insert_with(|| Namespace::new(path, A::default(), self.ack_registry.clone(), self.config.clone()))
            .clone()
    }

    /// Accepts a new transport-level channel: assigns it a [`SessionId`] and
    /// spawns its [`Connection`] task.
    pub fn accept(self: &Arc<Self>, channel: Box<dyn MessageChannel>) -> SessionId {
        let id = SessionId::new();
        let connection = Connection::new(id, self.clone(), channel);
        tokio::spawn(connection.run());
        id
    }

    #[cfg(test)]
    pub(crate) fn ack_registry(&self) -> Arc<AckRegistry> {
        self.ack_registry.clone()
    }
}
