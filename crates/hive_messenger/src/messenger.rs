//! Messenger: the public face of the crate.
//!
//! [`Messenger`] ties the pieces together. It owns:
//! - the inbound listener on the [`Transport`] (classify, then dispatch)
//! - the beacon task (periodic presence announcements)
//! - `send` (log, sequence, wrap, transmit)
//! - `destroy` (disconnect every peer, drop the registry slot)
//!
//! Protocol handlers run with the registry lock held and only *compute* what
//! to transmit and deliver. The lock is released before the transport or the
//! application callback is touched, so a synchronous transport that
//! re-enters another messenger cannot deadlock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::classify::{Classifier, Inbound, RawMessage};
use crate::config::MessengerConfig;
use crate::connection::{Arrival, Connection, Verdict};
use crate::discovery;
use crate::error::MessengerError;
use crate::identity::PeerId;
use crate::message::{Envelope, LocalPeer, MessageKind, OutboundEvent, UNSEQUENCED};
use crate::recovery;
use crate::registry::{InstanceState, Registry};
use crate::transport::{ListenerId, Transport};

/// Application callback for delivered events.
pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Called with the envelope whenever the transport rejects a submission.
pub type FailureHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Configures and starts a [`Messenger`].
pub struct MessengerBuilder {
    config: MessengerConfig,
    transport: Arc<dyn Transport>,
    registry: Option<Registry>,
    on_event: Option<EventHandler>,
    on_send_failure: Option<FailureHandler>,
}

impl MessengerBuilder {
    pub fn new(config: MessengerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            registry: None,
            on_event: None,
            on_send_failure: None,
        }
    }

    /// Use `registry` instead of [`Registry::shared`].
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Receive every delivered application event, in order per sender.
    pub fn on_event(mut self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(handler));
        self
    }

    pub fn on_send_failure(mut self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.on_send_failure = Some(Arc::new(handler));
        self
    }

    /// Validate the config, attach to the transport and start beaconing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<Messenger, MessengerError> {
        self.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| MessengerError::NoRuntime)?;

        let id = self.config.id.clone().unwrap_or_else(PeerId::generate);
        let registry = self.registry.unwrap_or_else(Registry::shared);
        let resumed = registry.contains(&id);
        registry.with_instance(&id, |_| ());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let inner = Arc::new(Inner {
            local: LocalPeer::new(id.clone(), &self.config.context),
            classifier: Classifier::new(id.clone(), &self.config.context),
            config: self.config,
            registry,
            transport: self.transport,
            on_event: self.on_event,
            on_send_failure: self.on_send_failure,
            destroyed: AtomicBool::new(false),
            listener: Mutex::new(None),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            beacon_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let listener_id = inner.transport.add_listener(Arc::new(move |raw| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_raw(raw);
            }
        }));
        *inner.listener.lock() = Some(listener_id);

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let task = discovery::spawn_beacon_loop(
            &runtime,
            inner.config.beacon_interval,
            shutdown_rx,
            move || weak.upgrade().is_some_and(|inner| inner.announce()),
        );
        *inner.beacon_task.lock() = Some(task);

        info!(
            "Messenger {id} started in context '{}'{}",
            inner.local.context,
            if resumed { " (resuming existing log)" } else { "" }
        );
        Ok(Messenger { inner })
    }
}

/// Ordered, at-least-once messaging over a lossy broadcast transport.
///
/// Dropping a `Messenger` detaches it from the transport and stops the
/// beacon task but keeps its registry slot, so a messenger re-created with
/// the same id resumes the same log. Call [`destroy`](Self::destroy) to say
/// goodbye to peers and clear the slot.
pub struct Messenger {
    inner: Arc<Inner>,
}

impl Messenger {
    pub fn builder(config: MessengerConfig, transport: Arc<dyn Transport>) -> MessengerBuilder {
        MessengerBuilder::new(config, transport)
    }

    /// Start a messenger on the shared registry with no callbacks.
    pub fn new(config: MessengerConfig, transport: Arc<dyn Transport>) -> Result<Self, MessengerError> {
        MessengerBuilder::new(config, transport).start()
    }

    /// Own peer id.
    pub fn id(&self) -> &PeerId {
        &self.inner.local.id
    }

    /// Own context tag.
    pub fn context(&self) -> &str {
        &self.inner.local.context
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    /// Send an application event, broadcast or targeted.
    ///
    /// The event is logged before transmission, so a failed submission can
    /// still reach peers through a later replay. Transport failures go to
    /// the failure handler, not to the caller.
    pub fn send(&self, event: OutboundEvent) -> Result<(), MessengerError> {
        self.inner.send(event)
    }

    /// Shorthand for a broadcast [`send`](Self::send).
    pub fn broadcast(&self, kind: impl Into<String>, payload: Value) -> Result<(), MessengerError> {
        self.send(OutboundEvent::new(kind, payload))
    }

    /// Shorthand for a targeted [`send`](Self::send).
    pub fn send_to(
        &self,
        target: &PeerId,
        kind: impl Into<String>,
        payload: Value,
    ) -> Result<(), MessengerError> {
        self.send(OutboundEvent::to(target.clone(), kind, payload))
    }

    /// Emit a beacon now instead of waiting for the next tick.
    pub fn announce(&self) {
        self.inner.announce();
    }

    /// Feed raw traffic in directly, as the transport listener does.
    pub fn handle_raw(&self, raw: impl Into<RawMessage>) {
        self.inner.handle_raw(raw.into());
    }

    /// Disconnect from every known peer and become inert. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Snapshot of the connection to `peer`.
    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        self.inner.registry.connection(self.id(), peer)
    }

    /// Every peer with a connection, sorted.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner.registry.peers(self.id())
    }

    /// Number of events in the Outbound Log.
    pub fn outbound_len(&self) -> usize {
        self.inner.registry.outbound_len(self.id())
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("id", self.id())
            .field("context", &self.context())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct Inner {
    local: LocalPeer,
    classifier: Classifier,
    config: MessengerConfig,
    registry: Registry,
    transport: Arc<dyn Transport>,
    on_event: Option<EventHandler>,
    on_send_failure: Option<FailureHandler>,
    destroyed: AtomicBool,
    listener: Mutex<Option<ListenerId>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    beacon_task: Mutex<Option<JoinHandle<()>>>,
}

/// What a handler decided to do once the registry lock is released.
#[derive(Default)]
struct Effects {
    deliver: Vec<Envelope>,
    transmit: Vec<Envelope>,
}

impl Inner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn send(&self, event: OutboundEvent) -> Result<(), MessengerError> {
        if self.is_destroyed() {
            return Err(MessengerError::Destroyed);
        }
        let kind = MessageKind::from(event.kind.as_str());
        if kind.is_control() {
            return Err(MessengerError::ReservedType(event.kind));
        }

        let envelope = self.registry.with_instance(&self.local.id, |state| {
            let payload = event.payload.clone();
            let target = event.target.clone();
            let log_index = state.log.append(event);
            self.local
                .wrap(&mut state.connections, kind, payload, target, log_index)
        });

        if self.config.debug {
            debug!(
                "Sending {} (seq {}) to {}",
                envelope.kind.as_str(),
                envelope.sequence,
                envelope
                    .target
                    .as_ref()
                    .map_or_else(|| "everyone".to_string(), PeerId::to_string)
            );
        }
        self.transmit(&envelope);
        Ok(())
    }

    /// Returns `false` once destroyed, which also ends the beacon loop.
    fn announce(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.transmit(&discovery::beacon(&self.local));
        true
    }

    fn transmit(&self, envelope: &Envelope) {
        if let Err(e) = self.transport.transmit(envelope) {
            warn!(
                "Failed to transmit {} from {}: {e}",
                envelope.kind.as_str(),
                self.local.id
            );
            if let Some(handler) = &self.on_send_failure {
                handler(envelope);
            }
        }
    }

    fn handle_raw(&self, raw: RawMessage) {
        if self.is_destroyed() {
            return;
        }
        let Some(inbound) = self.classifier.classify(raw) else {
            return;
        };

        let effects = self
            .registry
            .with_instance(&self.local.id, |state| self.process(state, inbound));
        match effects {
            Ok(effects) => self.apply(effects),
            Err(e) => warn!("Failed to handle inbound message on {}: {e}", self.local.id),
        }
    }

    fn apply(&self, effects: Effects) {
        for envelope in &effects.deliver {
            if self.is_destroyed() {
                return;
            }
            if let Some(handler) = &self.on_event {
                handler(envelope);
            }
        }
        for envelope in &effects.transmit {
            self.transmit(envelope);
        }
    }

    fn process(&self, state: &mut InstanceState, inbound: Inbound) -> Result<Effects, MessengerError> {
        let verbose = self.config.debug;
        let mut effects = Effects::default();

        match inbound {
            Inbound::Beacon { sender } => {
                if let Some(batch) = discovery::handle_beacon(state, &self.local, &sender, verbose)? {
                    effects.transmit.push(batch);
                }
            }
            Inbound::Disconnect { sender } => {
                if state.connections.remove(&sender).is_some() && verbose {
                    debug!("Peer {sender} disconnected from {}", self.local.id);
                }
            }
            Inbound::LostEventsRequest {
                sender,
                messages_received,
            } => {
                if let Some(batch) = recovery::handle_lost_events_request(
                    state,
                    &self.local,
                    &sender,
                    messages_received,
                    verbose,
                )? {
                    effects.transmit.push(batch);
                }
            }
            Inbound::EventBatch { sender, events } => {
                let received = state.connections.get_or_create(&sender).messages_received;
                let fresh: Vec<Envelope> = events
                    .into_iter()
                    .filter(|e| e.sequence().is_some_and(|seq| seq > received))
                    .collect();
                let Some(first) = fresh.first().and_then(Envelope::sequence) else {
                    trace!("Batch from {sender} holds nothing new");
                    return Ok(effects);
                };
                let len = fresh.len() as u64;
                self.admit(state, &sender, first, len, Arrival::Replay, fresh, &mut effects);
            }
            Inbound::Event(envelope) => match envelope.sequence() {
                Some(seq) => {
                    let sender = envelope.sender.clone();
                    self.admit(state, &sender, seq, 1, Arrival::Live, vec![envelope], &mut effects);
                }
                None if envelope.sequence == UNSEQUENCED => {
                    state.connections.get_or_create(&envelope.sender);
                    effects.deliver.push(envelope);
                }
                None => trace!(
                    "Ignoring {} from {} with invalid sequence {}",
                    envelope.kind.as_str(),
                    envelope.sender,
                    envelope.sequence
                ),
            },
        }
        Ok(effects)
    }

    #[allow(clippy::too_many_arguments)]
    fn admit(
        &self,
        state: &mut InstanceState,
        sender: &PeerId,
        seq: u64,
        len: u64,
        arrival: Arrival,
        events: Vec<Envelope>,
        effects: &mut Effects,
    ) {
        let now = chrono::Utc::now().timestamp_millis();
        let retry_after = i64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(i64::MAX);
        let verdict = state
            .connections
            .get_or_create(sender)
            .admit(seq, len, arrival, now, retry_after);

        match verdict {
            Verdict::Accept => effects.deliver.extend(events),
            Verdict::Stale => trace!("Dropping duplicate seq {seq} from {sender}"),
            Verdict::Gap { messages_received } => {
                if self.config.debug {
                    debug!(
                        "Gap from {sender}: got seq {seq}, expected {}; requesting replay",
                        messages_received + 1
                    );
                }
                effects.transmit.push(recovery::lost_events_request(
                    &self.local,
                    sender,
                    messages_received,
                ));
            }
            Verdict::AwaitingReplay => {
                if self.config.debug {
                    debug!("Dropping seq {seq} from {sender} while a replay is pending");
                }
            }
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach();

        let peers = self
            .registry
            .with_instance(&self.local.id, |state| state.connections.peers());
        for peer in &peers {
            self.transmit(&self.local.control(
                MessageKind::Disconnect,
                Value::Null,
                Some(peer.clone()),
            ));
        }
        self.registry.remove(&self.local.id);

        info!(
            "Messenger {} destroyed ({} peers notified)",
            self.local.id,
            peers.len()
        );
    }

    /// Stop the beacon task and leave the transport.
    fn detach(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.beacon_task.lock().take() {
            task.abort();
        }
        if let Some(id) = self.listener.lock().take() {
            self.transport.remove_listener(id);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.detach();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
