//! Correlates outbound requests to inbound ACKs.
//!
//! Owned by [`crate::server::Server`] rather than by each
//! [`crate::connection::Connection`]: a broadcast ACK's responses can arrive
//! on as many different connections as there are targets, so the table that
//! aggregates them has to be reachable from all of them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::AckError;
use crate::id::{AckIdGenerator, SocketId};

/// What an acknowledging client sent back.
#[derive(Debug, Clone, PartialEq)]
pub struct AckResponse {
    pub args: Vec<Value>,
    pub binary: Vec<Vec<u8>>,
}

/// One slot in a broadcast ack's result set.
#[derive(Debug)]
pub struct BroadcastAckEntry {
    pub socket: SocketId,
    pub result: Result<AckResponse, AckError>,
}

/// Outcome delivered once a broadcast ack either completes or times out.
#[derive(Debug)]
pub enum BroadcastOutcome {
    /// Every expected socket responded.
    Complete(Vec<BroadcastAckEntry>),
    /// The deadline elapsed first; carries whatever arrived in time.
    TimedOut(Vec<BroadcastAckEntry>),
}

enum Entry {
    Single(oneshot::Sender<Result<AckResponse, AckError>>),
    Broadcast(BroadcastState),
}

struct BroadcastState {
    targets: Vec<SocketId>,
    expected: usize,
    received: Vec<BroadcastAckEntry>,
    done: Option<oneshot::Sender<BroadcastOutcome>>,
}

/// Server-wide ACK correlator. ID space is shared across all namespaces so
/// one table suffices regardless of how many namespaces are in play.
pub struct AckRegistry {
    ids: AckIdGenerator,
    table: Mutex<HashMap<i64, Entry>>,
    /// Reverse index from a socket to the broadcast ack ids it is still
    /// owed a response for, so [`Self::socket_gone`] can complete its slots
    /// without the caller having to track ack ids itself.
    pending_by_socket: Mutex<HashMap<SocketId, HashSet<i64>>>,
    max_size: usize,
}

/// A handle to a pending broadcast ack, returned by
/// [`crate::operators::Operators::emit_with_ack`].
#[derive(Debug)]
pub struct AckHandle {
    id: i64,
    rx: oneshot::Receiver<BroadcastOutcome>,
}

impl AckHandle {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Waits for the broadcast ack to complete or time out.
    pub async fn wait(self) -> BroadcastOutcome {
        self.rx.await.unwrap_or(BroadcastOutcome::TimedOut(Vec::new()))
    }
}

impl AckRegistry {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            ids: AckIdGenerator::new(),
            table: Mutex::new(HashMap::new()),
            pending_by_socket: Mutex::new(HashMap::new()),
            max_size,
        })
    }

    fn next_id(&self) -> i64 {
        self.ids.next()
    }

    /// Registers a single-target ack and schedules its timeout. Returns the
    /// assigned id and a receiver the caller awaits.
    pub fn register_single(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<(i64, oneshot::Receiver<Result<AckResponse, AckError>>), AckError> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id();
        {
            let mut table = self.table.lock().unwrap();
            if table.len() >= self.max_size {
                return Err(AckError::TableFull);
            }
            table.insert(id, Entry::Single(tx));
        }
        self.schedule_single_timeout(id, timeout);
        Ok((id, rx))
    }

    fn schedule_single_timeout(self: &Arc<Self>, id: i64, timeout: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = this.table.lock().unwrap().remove(&id);
            if let Some(Entry::Single(tx)) = entry {
                let _ = tx.send(Err(AckError::Timeout));
            }
        });
    }

    /// Resolves a single-target ack. A response for an id that is no longer
    /// in the table (already resolved, or timed out) is a no-op, logged as a
    /// late ack.
    pub fn resolve_single(&self, id: i64, response: AckResponse) {
        let entry = self.table.lock().unwrap().remove(&id);
        match entry {
            Some(Entry::Single(tx)) => {
                let _ = tx.send(Ok(response));
            }
            Some(other) => {
                // Wrong shape for this id; put it back untouched.
                self.table.lock().unwrap().insert(id, other);
                tracing::warn!(id, "late/mismatched ack ignored");
            }
            None => tracing::warn!(id, "late ack ignored: no pending registration"),
        }
    }

    /// Registers a broadcast ack expecting a response from each of `targets`.
    pub fn register_broadcast(
        self: &Arc<Self>,
        targets: Vec<SocketId>,
        timeout: Duration,
    ) -> Result<AckHandle, AckError> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id();
        let expected = targets.len();
        {
            let mut table = self.table.lock().unwrap();
            if table.len() >= self.max_size {
                return Err(AckError::TableFull);
            }
            table.insert(
                id,
                Entry::Broadcast(BroadcastState {
                    targets: targets.clone(),
                    expected,
                    received: Vec::new(),
                    done: Some(tx),
                }),
            );
        }
        {
            let mut by_socket = self.pending_by_socket.lock().unwrap();
            for sid in &targets {
                by_socket.entry(*sid).or_default().insert(id);
            }
        }
        if expected == 0 {
            self.complete_broadcast(id);
        } else {
            self.schedule_broadcast_timeout(id, timeout);
        }
        Ok(AckHandle { id, rx })
    }

    fn schedule_broadcast_timeout(self: &Arc<Self>, id: i64, timeout: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(state) = this.take_broadcast(id) {
                if let Some(done) = state.done {
                    let _ = done.send(BroadcastOutcome::TimedOut(state.received));
                }
            }
        });
    }

    fn complete_broadcast(&self, id: i64) {
        if let Some(state) = self.take_broadcast(id) {
            if let Some(done) = state.done {
                let _ = done.send(BroadcastOutcome::Complete(state.received));
            }
        }
    }

    /// Removes a broadcast entry from both the main table and the
    /// socket→pending-ids reverse index, returning its final state.
    fn take_broadcast(&self, id: i64) -> Option<BroadcastState> {
        let mut table = self.table.lock().unwrap();
        let Some(Entry::Broadcast(state)) = table.remove(&id) else {
            return None;
        };
        drop(table);
        let mut by_socket = self.pending_by_socket.lock().unwrap();
        for sid in &state.targets {
            if let Some(set) = by_socket.get_mut(sid) {
                set.remove(&id);
                if set.is_empty() {
                    by_socket.remove(sid);
                }
            }
        }
        Some(state)
    }

    /// Appends one socket's response to a pending broadcast ack, completing
    /// it once every expected response has arrived. Responses are recorded
    /// in arrival order, not caller-submission order.
    pub fn resolve_broadcast(&self, id: i64, socket: SocketId, response: AckResponse) {
        let complete = {
            let mut table = self.table.lock().unwrap();
            match table.get_mut(&id) {
                Some(Entry::Broadcast(state)) => {
                    state.received.push(BroadcastAckEntry {
                        socket,
                        result: Ok(response),
                    });
                    state.received.len() >= state.expected
                }
                _ => false,
            }
        };
        if complete {
            self.complete_broadcast(id);
        }
    }

    /// Resolves whichever kind of pending ack `id` refers to. The
    /// connection dispatching an inbound ACK packet knows only the id and
    /// which socket sent it, not whether that id was registered as a single
    /// or a broadcast ack.
    pub fn resolve(&self, id: i64, socket: SocketId, response: AckResponse) {
        let is_broadcast = match self.table.lock().unwrap().get(&id) {
            Some(Entry::Single(_)) => false,
            Some(Entry::Broadcast(_)) => true,
            None => {
                tracing::warn!(id, "late ack ignored: no pending registration");
                return;
            }
        };
        if is_broadcast {
            self.resolve_broadcast(id, socket, response);
        } else {
            self.resolve_single(id, response);
        }
    }

    /// Marks a socket's slot in every pending broadcast ack that targets it
    /// as disconnected, so no callback is left pending past the deadline for
    /// a socket that will never answer.
    pub fn socket_gone(&self, socket: SocketId) {
        let ids: Vec<i64> = self
            .pending_by_socket
            .lock()
            .unwrap()
            .get(&socket)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let complete = {
                let mut table = self.table.lock().unwrap();
                match table.get_mut(&id) {
                    Some(Entry::Broadcast(state)) => {
                        state.received.push(BroadcastAckEntry {
                            socket,
                            result: Err(AckError::Aborted(socket)),
                        });
                        state.received.len() >= state.expected
                    }
                    _ => false,
                }
            };
            if complete {
                self.complete_broadcast(id);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn response(n: i64) -> AckResponse {
        AckResponse {
            args: vec![Value::from(n)],
            binary: Vec::new(),
        }
    }

    #[tokio::test]
    async fn single_ack_resolves_once() {
        let registry = AckRegistry::new(100);
        let (id, rx) = registry.register_single(Duration::from_secs(1)).unwrap();
        registry.resolve_single(id, response(5));
        assert_eq!(rx.await.unwrap().unwrap(), response(5));
    }

    #[tokio::test]
    async fn single_ack_times_out() {
        tokio::time::pause();
        let registry = AckRegistry::new(100);
        let (_, rx) = registry.register_single(Duration::from_millis(10)).unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(AckError::Timeout)));
    }

    #[tokio::test]
    async fn late_ack_after_resolution_is_ignored() {
        let registry = AckRegistry::new(100);
        let (id, rx) = registry.register_single(Duration::from_secs(1)).unwrap();
        registry.resolve_single(id, response(1));
        registry.resolve_single(id, response(2)); // late, dropped
        assert_eq!(rx.await.unwrap().unwrap(), response(1));
    }

    #[tokio::test]
    async fn broadcast_ack_aggregates_in_arrival_order() {
        let registry = AckRegistry::new(100);
        let s1 = SocketId::new();
        let s2 = SocketId::new();
        let handle = registry.register_broadcast(vec![s1, s2], Duration::from_secs(1)).unwrap();
        let id = handle.id();
        registry.resolve_broadcast(id, s2, response(2));
        registry.resolve_broadcast(id, s1, response(1));
        match handle.wait().await {
            BroadcastOutcome::Complete(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].socket, s2);
                assert_eq!(entries[1].socket, s1);
            }
            BroadcastOutcome::TimedOut(_) => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn broadcast_ack_times_out_with_partial_results() {
        tokio::time::pause();
        let registry = AckRegistry::new(100);
        let s1 = SocketId::new();
        let s2 = SocketId::new();
        let handle = registry.register_broadcast(vec![s1, s2], Duration::from_millis(50)).unwrap();
        let id = handle.id();
        registry.resolve_broadcast(id, s1, response(1));
        tokio::time::advance(Duration::from_millis(60)).await;
        match handle.wait().await {
            BroadcastOutcome::TimedOut(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].socket, s1);
            }
            BroadcastOutcome::Complete(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn resolve_dispatches_to_the_right_kind_of_entry() {
        let registry = AckRegistry::new(100);
        let (id, rx) = registry.register_single(Duration::from_secs(1)).unwrap();
        registry.resolve(id, SocketId::new(), response(9));
        assert_eq!(rx.await.unwrap().unwrap(), response(9));
    }

    #[tokio::test]
    async fn broadcast_registration_rejected_once_table_is_full() {
        let registry = AckRegistry::new(1);
        let _first = registry.register_broadcast(vec![SocketId::new()], Duration::from_secs(1)).unwrap();
        let err = registry.register_broadcast(vec![SocketId::new()], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AckError::TableFull));
    }

    #[tokio::test]
    async fn disconnected_target_completes_its_slot_as_aborted() {
        let registry = AckRegistry::new(100);
        let s1 = SocketId::new();
        let handle = registry.register_broadcast(vec![s1], Duration::from_secs(1)).unwrap();
        registry.socket_gone(s1);
        match handle.wait().await {
            BroadcastOutcome::Complete(entries) => {
                assert_eq!(entries.len(), 1);
                assert!(matches!(entries[0].result, Err(AckError::Aborted(_))));
            }
            BroadcastOutcome::TimedOut(_) => panic!("expected completion"),
        }
    }
}
