//! Opaque identifiers used throughout the crate.
//!
//! [`SessionId`] and [`SocketId`] wrap a [`Uuid`] rather than a bare
//! `String` so that passing a room name where a socket id is expected is a
//! type error instead of a silent bug.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(SessionId);
opaque_id!(SocketId);

/// A monotonically increasing, server-wide ACK id generator.
///
/// Socket.IO ack ids are plain decimal integers on the wire; the server
/// hands out a fresh one per outgoing request-with-callback, never reusing
/// one while the server is alive.
#[derive(Debug, Default)]
pub struct AckIdGenerator(AtomicI64);

impl AckIdGenerator {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Returns the next ack id. `fetch_add` wraps on overflow rather than
    /// panicking if the 64-bit counter is ever exhausted.
    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ack_ids_strictly_increase() {
        let gen = AckIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn socket_ids_are_unique() {
        let a = SocketId::new();
        let b = SocketId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn id_round_trips_through_display_and_parse() {
        let id = SocketId::new();
        let text = id.to_string();
        let parsed: SocketId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }
}
