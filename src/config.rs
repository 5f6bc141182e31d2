//! Server-wide configuration, built through a `ServerConfigBuilder`.

use std::time::Duration;

/// Recognized configuration options and their defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_payload: usize,
    pub connect_timeout: Duration,
    pub close_grace: Duration,
    pub ack_timeout_default: Duration,
    pub max_ack_table_size: usize,
    pub per_connection_outbound_queue: usize,
    pub cleanup_empty_child_namespaces: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(20),
            max_payload: 1_000_000,
            connect_timeout: Duration::from_secs(45),
            close_grace: Duration::from_millis(500),
            ack_timeout_default: Duration::from_secs(5),
            max_ack_table_size: 10_000,
            per_connection_outbound_queue: 1024,
            cleanup_empty_child_namespaces: false,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ServerConfigBuilder(ServerConfig);

macro_rules! builder_field {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.0.$name = value;
            self
        }
    };
}

impl ServerConfigBuilder {
    builder_field!(ping_interval, Duration);
    builder_field!(ping_timeout, Duration);
    builder_field!(max_payload, usize);
    builder_field!(connect_timeout, Duration);
    builder_field!(close_grace, Duration);
    builder_field!(ack_timeout_default, Duration);
    builder_field!(max_ack_table_size, usize);
    builder_field!(per_connection_outbound_queue, usize);
    builder_field!(cleanup_empty_child_namespaces, bool);

    pub fn build(self) -> ServerConfig {
        self.0
    }
}
