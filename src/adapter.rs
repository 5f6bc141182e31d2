//! The per-namespace room↔socket index and broadcast dispatcher.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use crate::error::AdapterError;
use crate::id::SocketId;
use crate::packet::Packet;
use crate::socket::Socket;

pub type Room = String;

/// Flags accumulated by a [`crate::operators::Operators`] chain and consumed
/// at emit time.
#[derive(Debug, Clone, Default)]
pub struct BroadcastFlags {
    pub local: bool,
    pub volatile: bool,
    pub compress: bool,
    pub timeout: Option<Duration>,
}

/// The resolved filter a broadcast operates with. Built by
/// [`crate::operators::Operators`], consumed once by the [`Adapter`].
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub rooms: Vec<Room>,
    pub except_rooms: Vec<Room>,
    pub except_sockets: Vec<SocketId>,
    /// `true` for the `broadcast()`/`to()` family, which excludes the
    /// originating socket; `false` for `within()`, which includes it.
    pub exclude_origin: bool,
    pub origin: Option<SocketId>,
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    pub fn new(origin: Option<SocketId>) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }
}

/// Lifecycle events fired by the [`LocalAdapter`] as rooms gain or lose
/// members. Namespace/Server code can observe these for logging or metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Created(Room),
    Joined(Room, SocketId),
    Left(Room, SocketId),
    Deleted(Room),
}

/// The seam a distributed adapter would implement: horizontal fan-out across
/// processes is not provided, but the trait is kept open rather than
/// hard-coding [`LocalAdapter`] everywhere.
pub trait Adapter: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn add_all(&self, sid: SocketId, rooms: Vec<Room>) -> Result<Vec<RoomEvent>, Self::Error>;
    fn del(&self, sid: SocketId, rooms: Vec<Room>) -> Result<Vec<RoomEvent>, Self::Error>;
    fn del_all(&self, sid: SocketId) -> Result<Vec<RoomEvent>, Self::Error>;
    fn socket_rooms(&self, sid: SocketId) -> Vec<Room>;
    fn resolve_targets(&self, opts: &BroadcastOptions) -> Vec<SocketId>;
}

/// The in-memory, single-process room index. This is the only [`Adapter`]
/// implementation this crate ships; a distributed adapter is not provided.
#[derive(Debug, Default)]
pub struct LocalAdapter {
    rooms: RwLock<HashMap<Room, HashSet<SocketId>>>,
    members: RwLock<HashMap<SocketId, HashSet<Room>>>,
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_one(&self, sid: SocketId, room: Room, events: &mut Vec<RoomEvent>) {
        let mut rooms = self.rooms.write().unwrap();
        let set = rooms.entry(room.clone()).or_default();
        let created = set.is_empty();
        let inserted = set.insert(sid);
        drop(rooms);

        if created {
            events.push(RoomEvent::Created(room.clone()));
        }
        if inserted {
            self.members.write().unwrap().entry(sid).or_default().insert(room.clone());
            events.push(RoomEvent::Joined(room, sid));
        }
    }

    fn remove_one(&self, sid: SocketId, room: &Room, events: &mut Vec<RoomEvent>) {
        let mut rooms = self.rooms.write().unwrap();
        let Some(set) = rooms.get_mut(room) else {
            return;
        };
        let removed = set.remove(&sid);
        let now_empty = set.is_empty();
        if now_empty {
            rooms.remove(room);
        }
        drop(rooms);

        if removed {
            if let Some(member_rooms) = self.members.write().unwrap().get_mut(&sid) {
                member_rooms.remove(room);
            }
            events.push(RoomEvent::Left(room.clone(), sid));
        }
        if now_empty {
            events.push(RoomEvent::Deleted(room.clone()));
        }
    }

    fn except_socket_ids(&self, opts: &BroadcastOptions) -> HashSet<SocketId> {
        let mut except: HashSet<SocketId> = opts.except_sockets.iter().copied().collect();
        if !opts.except_rooms.is_empty() {
            let rooms = self.rooms.read().unwrap();
            for room in &opts.except_rooms {
                if let Some(set) = rooms.get(room) {
                    except.extend(set.iter().copied());
                }
            }
        }
        except
    }
}

impl Adapter for LocalAdapter {
    type Error = std::convert::Infallible;

    fn add_all(&self, sid: SocketId, rooms: Vec<Room>) -> Result<Vec<RoomEvent>, Self::Error> {
        let mut events = Vec::new();
        for room in rooms {
            self.add_one(sid, room, &mut events);
        }
        Ok(events)
    }

    fn del(&self, sid: SocketId, rooms: Vec<Room>) -> Result<Vec<RoomEvent>, Self::Error> {
        let mut events = Vec::new();
        for room in rooms {
            self.remove_one(sid, &room, &mut events);
        }
        Ok(events)
    }

    /// O(|rooms-of-socket|): looks up the socket's own room set rather than
    /// scanning every room in the namespace.
    fn del_all(&self, sid: SocketId) -> Result<Vec<RoomEvent>, Self::Error> {
        let rooms: Vec<Room> = self
            .members
            .read()
            .unwrap()
            .get(&sid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut events = Vec::new();
        for room in rooms {
            self.remove_one(sid, &room, &mut events);
        }
        Ok(events)
    }

    fn socket_rooms(&self, sid: SocketId) -> Vec<Room> {
        self.members
            .read()
            .unwrap()
            .get(&sid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn resolve_targets(&self, opts: &BroadcastOptions) -> Vec<SocketId> {
        let except = self.except_socket_ids(opts);
        let rooms = self.rooms.read().unwrap();

        let mut targets: HashSet<SocketId> = if opts.rooms.is_empty() {
            self.members.read().unwrap().keys().copied().collect()
        } else {
            opts.rooms
                .iter()
                .filter_map(|r| rooms.get(r))
                .flat_map(|set| set.iter().copied())
                .collect()
        };

        if opts.exclude_origin {
            if let Some(origin) = opts.origin {
                targets.remove(&origin);
            }
        }
        targets.retain(|sid| !except.contains(sid));
        targets.into_iter().collect()
    }
}

/// Resolves `opts` against `adapter` and enqueues the encoded packet on each
/// target's connection. Broadcast always re-resolves targets per-namespace
/// at emit time rather than reusing a precompiled packet across namespaces.
pub fn broadcast<A: Adapter>(
    adapter: &A,
    packet: &Packet,
    opts: &BroadcastOptions,
    lookup: impl Fn(SocketId) -> Option<std::sync::Arc<Socket<A>>>,
) -> Result<(), AdapterError> {
    let targets = adapter.resolve_targets(opts);
    tracing::debug!(count = targets.len(), "broadcasting packet");
    for sid in targets {
        if let Some(socket) = lookup(sid) {
            socket.send_raw(packet.clone(), opts.flags.volatile)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let adapter = LocalAdapter::new();
        let sid = SocketId::new();
        adapter.add_all(sid, vec!["r1".into()]).unwrap();
        let events = adapter.add_all(sid, vec!["r1".into()]).unwrap();
        assert!(events.is_empty(), "second add should be a no-op");
        assert_eq!(adapter.socket_rooms(sid), vec!["r1".to_string()]);
    }

    #[test]
    fn remove_is_idempotent() {
        let adapter = LocalAdapter::new();
        let sid = SocketId::new();
        adapter.add_all(sid, vec!["r1".into()]).unwrap();
        adapter.del(sid, vec!["r1".into()]).unwrap();
        let events = adapter.del(sid, vec!["r1".into()]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn room_created_and_deleted_events_fire_once() {
        let adapter = LocalAdapter::new();
        let a = SocketId::new();
        let b = SocketId::new();
        let events = adapter.add_all(a, vec!["r1".into()]).unwrap();
        assert_eq!(events, vec![RoomEvent::Created("r1".into()), RoomEvent::Joined("r1".into(), a)]);

        let events = adapter.add_all(b, vec!["r1".into()]).unwrap();
        assert_eq!(events, vec![RoomEvent::Joined("r1".into(), b)]);

        adapter.del(a, vec!["r1".into()]).unwrap();
        let events = adapter.del(b, vec!["r1".into()]).unwrap();
        assert_eq!(events, vec![RoomEvent::Left("r1".into(), b), RoomEvent::Deleted("r1".into())]);
    }

    #[test]
    fn remove_all_matches_removing_each_room_individually() {
        let adapter = LocalAdapter::new();
        let sid = SocketId::new();
        adapter.add_all(sid, vec!["a".into(), "b".into(), "c".into()]).unwrap();
        adapter.del_all(sid).unwrap();
        assert!(adapter.socket_rooms(sid).is_empty());
        assert!(adapter.resolve_targets(&BroadcastOptions::new(None)).is_empty());
    }

    #[test]
    fn resolve_targets_unions_across_rooms_and_respects_except() {
        let adapter = LocalAdapter::new();
        let a = SocketId::new();
        let b = SocketId::new();
        let c = SocketId::new();
        adapter.add_all(a, vec!["r1".into()]).unwrap();
        adapter.add_all(b, vec!["r2".into()]).unwrap();
        adapter.add_all(c, vec!["r1".into(), "r2".into()]).unwrap();

        let mut opts = BroadcastOptions::new(None);
        opts.rooms = vec!["r1".into(), "r2".into()];
        opts.except_rooms = vec!["r2".into()];
        let targets: HashSet<_> = adapter.resolve_targets(&opts).into_iter().collect();
        // r2 members (b, c) are excluded entirely via except_rooms.
        assert_eq!(targets, HashSet::from([a]));
    }

    #[test]
    fn no_rooms_targets_everyone_attached() {
        let adapter = LocalAdapter::new();
        let a = SocketId::new();
        let b = SocketId::new();
        adapter.add_all(a, vec!["self-a".into()]).unwrap();
        adapter.add_all(b, vec!["self-b".into()]).unwrap();
        let targets: HashSet<_> = adapter
            .resolve_targets(&BroadcastOptions::new(None))
            .into_iter()
            .collect();
        assert_eq!(targets, HashSet::from([a, b]));
    }
}
