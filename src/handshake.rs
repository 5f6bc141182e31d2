//! Read-only attach-time metadata surfaced to middleware and listeners.

use std::collections::HashMap;
use std::time::SystemTime;

use serde_json::Value;

/// Snapshot of the information available when a socket attaches to a
/// namespace. Immutable for the lifetime of the socket.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub headers: HashMap<String, String>,
    pub time: SystemTime,
    pub address: String,
    pub secure: bool,
    pub issued: u64,
    pub url: String,
    pub query: HashMap<String, String>,
    pub auth: Value,
}

impl Handshake {
    pub fn new(address: impl Into<String>, url: impl Into<String>, auth: Value) -> Self {
        let time = SystemTime::now();
        let issued = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            headers: HashMap::new(),
            time,
            address: address.into(),
            secure: false,
            issued,
            url: url.into(),
            query: HashMap::new(),
            auth,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}
