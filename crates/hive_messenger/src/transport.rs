//! Transport seam: the "post a message" primitive the messenger runs on.
//!
//! A [`Transport`] is fire-and-forget: `transmit` reports only whether the
//! envelope was handed off, never whether anyone received it. Listeners see
//! every message on the channel, including our own and other contexts'
//! traffic; filtering is the classifier's job.
//!
//! [`MemoryChannel`] is an in-process adapter with a delivery queue. It is
//! lossy on demand (drop filter) and can fail submissions, which makes it the
//! harness for the protocol tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::classify::RawMessage;
use crate::error::MessengerError;
use crate::message::Envelope;

/// Callback invoked for every raw message on the channel.
pub type Listener = Arc<dyn Fn(RawMessage) + Send + Sync>;

/// Handle returned by [`Transport::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// The environment-supplied message primitive.
pub trait Transport: Send + Sync {
    /// Submit an envelope. `Ok` means handed off, not delivered.
    fn transmit(&self, envelope: &Envelope) -> Result<(), MessengerError>;

    /// Start receiving raw traffic.
    fn add_listener(&self, listener: Listener) -> ListenerId;

    /// Stop receiving raw traffic. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);
}

/// Predicate deciding which envelopes get lost in transit.
pub type DropFilter = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Upper bound on deliveries per [`MemoryChannel::flush`] call.
const MAX_FLUSH_DELIVERIES: usize = 100_000;

#[derive(Default)]
struct ChannelState {
    listeners: BTreeMap<ListenerId, Listener>,
    next_listener: u64,
    queue: VecDeque<String>,
    transmitted: Vec<Envelope>,
    drop_filter: Option<DropFilter>,
    fail_next: usize,
    dropped: usize,
}

/// Shared in-process broadcast channel.
///
/// `transmit` only enqueues; call [`flush`](Self::flush) to deliver. Cloning
/// yields another handle to the same channel.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver queued messages to every listener until the queue is empty,
    /// including messages enqueued while delivering. Returns the number of
    /// messages delivered.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_FLUSH_DELIVERIES {
            let (text, listeners) = {
                let mut state = self.state.lock();
                let Some(text) = state.queue.pop_front() else {
                    return delivered;
                };
                let listeners: Vec<Listener> = state.listeners.values().cloned().collect();
                (text, listeners)
            };
            for listener in listeners {
                listener(RawMessage::Text(text.clone()));
            }
            delivered += 1;
        }
        warn!("MemoryChannel flush stopped after {MAX_FLUSH_DELIVERIES} deliveries");
        delivered
    }

    /// Hand raw traffic straight to every listener, bypassing the queue.
    pub fn inject(&self, raw: RawMessage) {
        let listeners: Vec<Listener> = self.state.lock().listeners.values().cloned().collect();
        for listener in listeners {
            listener(raw.clone());
        }
    }

    /// Lose every envelope matching `filter` from now on.
    pub fn set_drop_filter(&self, filter: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
        self.state.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.state.lock().drop_filter = None;
    }

    /// Make the next `count` submissions fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Every envelope successfully submitted so far, dropped ones included.
    pub fn transmitted(&self) -> Vec<Envelope> {
        self.state.lock().transmitted.clone()
    }

    /// Forget the submission history.
    pub fn clear_transmitted(&self) {
        self.state.lock().transmitted.clear();
    }

    /// Number of envelopes lost to the drop filter.
    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    /// Messages waiting for [`flush`](Self::flush).
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

impl Transport for MemoryChannel {
    fn transmit(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(MessengerError::Transport("channel rejected message".to_string()));
        }

        let text = envelope.to_json()?;
        state.transmitted.push(envelope.clone());

        let lost = state
            .drop_filter
            .as_ref()
            .is_some_and(|filter| filter(envelope));
        if lost {
            trace!("Dropping {} from {} in transit", envelope.kind.as_str(), envelope.sender);
            state.dropped += 1;
        } else {
            state.queue.push_back(text);
        }
        Ok(())
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.state.lock().listeners.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::message::MessageKind;

    fn beacon(sender: &str) -> Envelope {
        Envelope::control(
            PeerId::from_string(sender),
            "runtime",
            MessageKind::Beacon,
            serde_json::Value::Null,
            None,
        )
    }

    fn recording_listener(channel: &MemoryChannel) -> (ListenerId, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = channel.add_listener(Arc::new(move |raw| {
            if let RawMessage::Text(text) = raw {
                sink.lock().push(text);
            }
        }));
        (id, seen)
    }

    #[test]
    fn test_transmit_queues_until_flush() {
        let channel = MemoryChannel::new();
        let (_, seen) = recording_listener(&channel);

        channel.transmit(&beacon("a")).unwrap();
        assert_eq!(channel.pending(), 1);
        assert!(seen.lock().is_empty());

        assert_eq!(channel.flush(), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_broadcasts_to_every_listener() {
        let channel = MemoryChannel::new();
        let (_, first) = recording_listener(&channel);
        let (_, second) = recording_listener(&channel);

        channel.transmit(&beacon("a")).unwrap();
        channel.flush();
        assert_eq!(first.lock().len(), 1);
        assert_eq!(second.lock().len(), 1);
    }

    #[test]
    fn test_removed_listener_stops_receiving() {
        let channel = MemoryChannel::new();
        let (id, seen) = recording_listener(&channel);
        channel.remove_listener(id);
        assert_eq!(channel.listener_count(), 0);

        channel.transmit(&beacon("a")).unwrap();
        channel.flush();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_drop_filter_loses_silently() {
        let channel = MemoryChannel::new();
        let (_, seen) = recording_listener(&channel);
        channel.set_drop_filter(|env| env.sender.as_str() == "a");

        assert!(channel.transmit(&beacon("a")).is_ok());
        channel.transmit(&beacon("b")).unwrap();
        channel.flush();

        assert_eq!(channel.dropped(), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(channel.transmitted().len(), 2);
    }

    #[test]
    fn test_fail_next_rejects_submissions() {
        let channel = MemoryChannel::new();
        channel.fail_next(1);

        let result = channel.transmit(&beacon("a"));
        assert!(matches!(result, Err(MessengerError::Transport(_))));
        assert!(channel.transmit(&beacon("a")).is_ok());
        assert_eq!(channel.transmitted().len(), 1);
    }
}
