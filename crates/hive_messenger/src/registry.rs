//! Registry: per-instance protocol state, addressed by own peer id.
//!
//! The Outbound Log and Connection table of an instance live here rather
//! than inside the [`Messenger`](crate::Messenger) object, so a messenger
//! re-created with the same id picks up the same history. The blast radius
//! of a reset is explicit: [`Registry::remove`] clears one id,
//! [`Registry::reset_all`] clears every id sharing the registry.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::connection::{Connection, ConnectionTable};
use crate::identity::PeerId;
use crate::message::OutboundEvent;

static SHARED: Lazy<Registry> = Lazy::new(Registry::new);

/// Append-only history of every application event an instance has sent.
#[derive(Debug, Default)]
pub struct OutboundLog {
    events: Vec<OutboundEvent>,
}

impl OutboundLog {
    /// Append an event, returning its 0-based position.
    pub fn append(&mut self, event: OutboundEvent) -> usize {
        self.events.push(event);
        self.events.len() - 1
    }

    /// The event at `index`.
    pub fn get(&self, index: usize) -> Option<&OutboundEvent> {
        self.events.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Everything the protocol tracks for one own id.
#[derive(Debug, Default)]
pub struct InstanceState {
    pub log: OutboundLog,
    pub connections: ConnectionTable,
}

/// Shared store of [`InstanceState`] keyed by own id.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    instances: Arc<Mutex<HashMap<PeerId, InstanceState>>>,
}

impl Registry {
    /// Create an empty, private registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry messengers use unless one is injected.
    pub fn shared() -> Self {
        SHARED.clone()
    }

    /// Run `f` against the state for `id`, creating it if needed.
    ///
    /// The registry lock is held for the duration of `f`; do not call out to
    /// transports or application callbacks from inside it.
    pub fn with_instance<R>(&self, id: &PeerId, f: impl FnOnce(&mut InstanceState) -> R) -> R {
        let mut instances = self.instances.lock();
        f(instances.entry(id.clone()).or_default())
    }

    /// Whether state exists for `id`.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.instances.lock().contains_key(id)
    }

    /// Snapshot of `owner`'s connection to `peer`.
    pub fn connection(&self, owner: &PeerId, peer: &PeerId) -> Option<Connection> {
        self.instances
            .lock()
            .get(owner)
            .and_then(|state| state.connections.get(peer).cloned())
    }

    /// Peers `owner` holds a connection to, sorted. Empty if unknown.
    pub fn peers(&self, owner: &PeerId) -> Vec<PeerId> {
        self.instances
            .lock()
            .get(owner)
            .map(|state| state.connections.peers())
            .unwrap_or_default()
    }

    /// Length of `owner`'s Outbound Log (0 if unknown).
    pub fn outbound_len(&self, owner: &PeerId) -> usize {
        self.instances
            .lock()
            .get(owner)
            .map(|state| state.log.len())
            .unwrap_or(0)
    }

    /// Drop the state for one id.
    pub fn remove(&self, id: &PeerId) -> Option<InstanceState> {
        self.instances.lock().remove(id)
    }

    /// Drop the state for every id in this registry.
    pub fn reset_all(&self) {
        let mut instances = self.instances.lock();
        debug!("Resetting registry ({} instances)", instances.len());
        instances.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
