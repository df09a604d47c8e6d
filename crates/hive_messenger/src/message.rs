//! Wire protocol: the envelope every message travels in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionTable;
use crate::identity::PeerId;

/// Sequence number carried by control messages and untargeted events.
pub const UNSEQUENCED: i64 = -1;

/// The kind of message carried in an [`Envelope`].
///
/// Serialized as the bare `type` string. The four control kinds are reserved;
/// any other string is an application event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Periodic presence announcement.
    Beacon,
    /// Clean teardown notification.
    Disconnect,
    /// Ask a peer to resend history after a detected gap.
    LostEventsRequest,
    /// Several application events replayed in one message.
    EventBatch,
    /// An application event with its type name.
    Event(String),
}

impl MessageKind {
    pub const BEACON: &'static str = "beacon";
    pub const DISCONNECT: &'static str = "disconnect";
    pub const LOST_EVENTS_REQUEST: &'static str = "lost-events-request";
    pub const EVENT_BATCH: &'static str = "event-batch";

    /// Whether this is one of the reserved control kinds.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Event(_))
    }

    /// The wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Beacon => Self::BEACON,
            Self::Disconnect => Self::DISCONNECT,
            Self::LostEventsRequest => Self::LOST_EVENTS_REQUEST,
            Self::EventBatch => Self::EVENT_BATCH,
            Self::Event(name) => name.as_str(),
        }
    }
}

impl From<String> for MessageKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            Self::BEACON => Self::Beacon,
            Self::DISCONNECT => Self::Disconnect,
            Self::LOST_EVENTS_REQUEST => Self::LostEventsRequest,
            Self::EVENT_BATCH => Self::EventBatch,
            _ => Self::Event(name),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Event(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

/// An application event handed to [`Messenger::send`](crate::Messenger::send).
///
/// This is exactly what the Outbound Log records; envelope metadata is
/// added fresh every time the event is (re)transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Application event type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque application payload.
    pub payload: Value,
    /// Destination peer. `None` means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
}

impl OutboundEvent {
    /// A broadcast event.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target: None,
        }
    }

    /// An event addressed to one peer.
    pub fn to(target: PeerId, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target: Some(target),
        }
    }
}

/// Payload of a `lost-events-request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LostEventsRequest {
    /// How many events the requester has accepted from the responder so far.
    pub messages_received: u64,
}

/// A network message envelope carrying a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol marker. Traffic without it is foreign and ignored.
    #[serde(rename = "__hive_messenger", default)]
    pub marker: bool,
    /// The kind/type of message.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// The payload data (interpreted based on `kind`).
    #[serde(default)]
    pub payload: Value,
    /// PeerId of the sender.
    pub sender: PeerId,
    /// Creation time in unix milliseconds.
    pub timestamp: i64,
    /// Context tag of the sender.
    pub context: String,
    /// Target peer. `None` means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    /// Per-destination sequence number, or [`UNSEQUENCED`].
    #[serde(default = "unsequenced")]
    pub sequence: i64,
}

fn unsequenced() -> i64 {
    UNSEQUENCED
}

impl Envelope {
    /// Build a marked envelope stamped with the current time.
    pub fn new(
        sender: PeerId,
        context: impl Into<String>,
        kind: MessageKind,
        payload: Value,
        target: Option<PeerId>,
        sequence: i64,
    ) -> Self {
        Self {
            marker: true,
            kind,
            payload,
            sender,
            timestamp: chrono::Utc::now().timestamp_millis(),
            context: context.into(),
            target,
            sequence,
        }
    }

    /// Build an unsequenced control envelope.
    pub fn control(
        sender: PeerId,
        context: impl Into<String>,
        kind: MessageKind,
        payload: Value,
        target: Option<PeerId>,
    ) -> Self {
        Self::new(sender, context, kind, payload, target, UNSEQUENCED)
    }

    /// The sequence number, if this envelope is ordered.
    pub fn sequence(&self) -> Option<u64> {
        u64::try_from(self.sequence).ok().filter(|s| *s > 0)
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The stamp an instance puts on everything it transmits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub id: PeerId,
    pub context: String,
}

impl LocalPeer {
    pub fn new(id: PeerId, context: impl Into<String>) -> Self {
        Self {
            id,
            context: context.into(),
        }
    }

    /// Envelope with an explicit sequence number.
    pub fn envelope(
        &self,
        kind: MessageKind,
        payload: Value,
        target: Option<PeerId>,
        sequence: i64,
    ) -> Envelope {
        Envelope::new(self.id.clone(), &self.context, kind, payload, target, sequence)
    }

    /// Unsequenced control envelope.
    pub fn control(&self, kind: MessageKind, payload: Value, target: Option<PeerId>) -> Envelope {
        Envelope::control(self.id.clone(), &self.context, kind, payload, target)
    }

    /// Stamp protocol metadata onto a message logged at `log_index`,
    /// assigning the next sequence number for its destination when it is an
    /// ordered application event.
    pub fn wrap(
        &self,
        connections: &mut ConnectionTable,
        kind: MessageKind,
        payload: Value,
        target: Option<PeerId>,
        log_index: usize,
    ) -> Envelope {
        let sequence = connections.compute_sequence(&kind, target.as_ref(), log_index);
        self.envelope(kind, payload, target, sequence)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
