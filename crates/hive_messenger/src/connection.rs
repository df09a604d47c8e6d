//! Connection tracker: per-peer sequence bookkeeping.
//!
//! Every peer this instance has heard from (or sent an ordered event to)
//! owns one [`Connection`]. The receiver never buffers out-of-order events:
//! a gap is answered by asking the sender to replay its history, which
//! arrives already in order.

use std::collections::HashMap;

use crate::identity::PeerId;
use crate::message::{MessageKind, UNSEQUENCED};

/// Ordering state for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connection {
    /// Ordered application events sent (or replayed) to this peer.
    pub messages_sent: u64,
    /// Outbound Log position behind each sequence sent to this peer:
    /// sequence `k` is `log_indices[k - 1]`.
    pub log_indices: Vec<usize>,
    /// Ordered application events accepted from this peer.
    pub messages_received: u64,
    /// A lost-events request is outstanding.
    pub desync: bool,
    /// When the outstanding request was issued (unix ms).
    pub requested_at: Option<i64>,
}

/// How an inbound ordered unit reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// A single event sent live.
    Live,
    /// An `event-batch` replaying history.
    Replay,
}

/// Outcome of [`Connection::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// In order: deliver it.
    Accept,
    /// Already seen: drop silently.
    Stale,
    /// Hole detected: request a replay starting after `messages_received`.
    Gap { messages_received: u64 },
    /// Hole detected while a replay is pending: drop, the replay covers it.
    AwaitingReplay,
}

impl Connection {
    /// Apply the ordering check to a unit of `len` events whose first member
    /// carries `seq`. Mutates state only on `Accept` and `Gap`.
    ///
    /// `retry_after_ms` bounds how often a lost request may be re-issued
    /// while `desync` is set.
    pub fn admit(
        &mut self,
        seq: u64,
        len: u64,
        arrival: Arrival,
        now_ms: i64,
        retry_after_ms: i64,
    ) -> Verdict {
        if seq <= self.messages_received {
            return Verdict::Stale;
        }

        let in_order = seq == self.messages_received + 1;
        if in_order || (self.desync && arrival == Arrival::Replay) {
            self.accept(len);
            return Verdict::Accept;
        }

        let request_expired = self
            .requested_at
            .is_some_and(|at| now_ms.saturating_sub(at) >= retry_after_ms);

        if !self.desync || request_expired {
            self.desync = true;
            self.requested_at = Some(now_ms);
            Verdict::Gap {
                messages_received: self.messages_received,
            }
        } else {
            Verdict::AwaitingReplay
        }
    }

    fn accept(&mut self, len: u64) {
        self.desync = false;
        self.requested_at = None;
        self.messages_received += len;
    }

    /// Assign the next outbound sequence number to the event logged at
    /// `log_index`.
    pub fn next_sequence(&mut self, log_index: usize) -> u64 {
        self.log_indices.push(log_index);
        self.messages_sent = self.log_indices.len() as u64;
        self.messages_sent
    }

    /// Log positions of everything sent after the first `count` sequences.
    pub fn sent_since(&self, count: usize) -> &[usize] {
        self.log_indices.get(count..).unwrap_or_default()
    }
}

/// All connections owned by one instance, keyed by peer.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<PeerId, Connection>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a connection, creating it on first contact.
    pub fn get_or_create(&mut self, peer: &PeerId) -> &mut Connection {
        self.connections.entry(peer.clone()).or_default()
    }

    /// Get a connection by peer.
    pub fn get(&self, peer: &PeerId) -> Option<&Connection> {
        self.connections.get(peer)
    }

    /// Get a mutable connection by peer.
    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(peer)
    }

    /// Whether this peer has been seen before.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }

    /// Sequence number for an outgoing message: [`UNSEQUENCED`] for control
    /// kinds and broadcasts, otherwise the destination's next number, bound
    /// to the event's position in the Outbound Log.
    pub fn compute_sequence(
        &mut self,
        kind: &MessageKind,
        target: Option<&PeerId>,
        log_index: usize,
    ) -> i64 {
        match target {
            Some(peer) if !kind.is_control() => {
                self.get_or_create(peer).next_sequence(log_index) as i64
            }
            _ => UNSEQUENCED,
        }
    }

    /// Forget a peer entirely.
    pub fn remove(&mut self, peer: &PeerId) -> Option<Connection> {
        self.connections.remove(peer)
    }

    /// All known peers, sorted for stable iteration.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Return the number of known peers.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no peer is known.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
