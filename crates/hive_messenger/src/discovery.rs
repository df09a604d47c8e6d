//! Discovery: periodic beacons and the bootstrap replay for new peers.
//!
//! There is no directory service: presence is announced over and over, so
//! beacon handling has to be idempotent. Only the first beacon seen from a
//! peer triggers a replay of the full Outbound Log.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::MessengerError;
use crate::identity::PeerId;
use crate::message::{Envelope, LocalPeer, MessageKind};
use crate::recovery::bootstrap_batch;
use crate::registry::InstanceState;

/// An untargeted presence announcement.
pub fn beacon(local: &LocalPeer) -> Envelope {
    local.control(MessageKind::Beacon, Value::Null, None)
}

/// Handle a beacon from `peer`. Returns the bootstrap batch to transmit
/// when the peer is new and we have history meant for it.
pub fn handle_beacon(
    state: &mut InstanceState,
    local: &LocalPeer,
    peer: &PeerId,
    verbose: bool,
) -> Result<Option<Envelope>, MessengerError> {
    if state.connections.contains(peer) {
        return Ok(None);
    }
    let batch = bootstrap_batch(state, local, peer)?;
    if verbose {
        let replayed = state.connections.get(peer).map_or(0, |c| c.log_indices.len());
        debug!("Discovered peer {peer}; replaying {replayed} logged events");
    }
    Ok(batch)
}

/// Spawn the beacon task. `announce` runs every `interval` until the
/// shutdown signal fires or it returns `false`.
pub fn spawn_beacon_loop(
    handle: &tokio::runtime::Handle,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
    announce: impl Fn() -> bool + Send + 'static,
) -> JoinHandle<()> {
    handle.spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !announce() {
                        debug!("Beacon loop lost its messenger");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Beacon loop shutting down");
                    break;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
