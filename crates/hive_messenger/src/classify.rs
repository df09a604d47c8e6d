//! Inbound classification: filters shared-channel noise and turns accepted
//! envelopes into an exhaustive [`Inbound`] variant.

use serde_json::Value;
use tracing::trace;

use crate::error::MessengerError;
use crate::identity::PeerId;
use crate::message::{Envelope, LostEventsRequest, MessageKind};

/// Raw traffic as handed over by a transport listener.
#[derive(Debug, Clone)]
pub enum RawMessage {
    /// Serialized JSON text.
    Text(String),
    /// An already-parsed JSON value.
    Value(Value),
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for RawMessage {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// An accepted envelope, dispatched on its reserved type.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Beacon {
        sender: PeerId,
    },
    Disconnect {
        sender: PeerId,
    },
    LostEventsRequest {
        sender: PeerId,
        messages_received: u64,
    },
    EventBatch {
        sender: PeerId,
        events: Vec<Envelope>,
    },
    Event(Envelope),
}

impl TryFrom<Envelope> for Inbound {
    type Error = MessengerError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let inbound = match envelope.kind {
            MessageKind::Beacon => Self::Beacon {
                sender: envelope.sender,
            },
            MessageKind::Disconnect => Self::Disconnect {
                sender: envelope.sender,
            },
            MessageKind::LostEventsRequest => {
                let request: LostEventsRequest = serde_json::from_value(envelope.payload)?;
                Self::LostEventsRequest {
                    sender: envelope.sender,
                    messages_received: request.messages_received,
                }
            }
            MessageKind::EventBatch => {
                let events: Vec<Envelope> = serde_json::from_value(envelope.payload)?;
                Self::EventBatch {
                    sender: envelope.sender,
                    events,
                }
            }
            MessageKind::Event(_) => Self::Event(envelope),
        };
        Ok(inbound)
    }
}

/// Decides which raw traffic belongs to one instance.
#[derive(Debug, Clone)]
pub struct Classifier {
    own_id: PeerId,
    own_context: String,
}

impl Classifier {
    pub fn new(own_id: PeerId, own_context: impl Into<String>) -> Self {
        Self {
            own_id,
            own_context: own_context.into(),
        }
    }

    /// Accept `raw` if it is protocol traffic from another context addressed
    /// to us (or to everyone). Everything else is silently dropped.
    pub fn accept(&self, raw: RawMessage) -> Option<Envelope> {
        let parsed = match raw {
            RawMessage::Text(text) => Envelope::from_json(&text),
            RawMessage::Value(value) => serde_json::from_value(value),
        };
        let envelope = match parsed {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!("Ignoring non-protocol traffic: {e}");
                return None;
            }
        };

        if !envelope.marker
            || envelope.sender == self.own_id
            || envelope.context == self.own_context
        {
            return None;
        }
        match &envelope.target {
            Some(target) if *target != self.own_id => None,
            _ => Some(envelope),
        }
    }

    /// [`accept`](Self::accept) followed by variant dispatch. Malformed
    /// control payloads are treated as noise.
    pub fn classify(&self, raw: RawMessage) -> Option<Inbound> {
        let envelope = self.accept(raw)?;
        let kind = envelope.kind.clone();
        match Inbound::try_from(envelope) {
            Ok(inbound) => Some(inbound),
            Err(e) => {
                trace!("Ignoring malformed {} payload: {e}", kind.as_str());
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UNSEQUENCED;

    fn panel() -> Classifier {
        Classifier::new(PeerId::from_string("B1"), "panel")
    }

    fn from_runtime(kind: MessageKind, payload: Value, target: Option<&str>) -> Envelope {
        Envelope::new(
            PeerId::from_string("A1"),
            "runtime",
            kind,
            payload,
            target.map(PeerId::from_string),
            UNSEQUENCED,
        )
    }

    #[test]
    fn test_accepts_broadcast_and_targeted() {
        let c = panel();
        let broadcast = from_runtime(MessageKind::Beacon, Value::Null, None);
        assert!(c.accept(RawMessage::Text(broadcast.to_json().unwrap())).is_some());

        let targeted = from_runtime(MessageKind::from("log"), Value::Null, Some("B1"));
        let value = serde_json::to_value(&targeted).unwrap();
        assert_eq!(c.accept(RawMessage::Value(value)), Some(targeted));
    }

    #[test]
    fn test_rejects_other_target() {
        let env = from_runtime(MessageKind::from("log"), Value::Null, Some("C9"));
        assert!(panel().accept(RawMessage::Value(serde_json::to_value(&env).unwrap())).is_none());
    }

    #[test]
    fn test_rejects_echo_by_context_and_sender() {
        let c = panel();
        let mut same_context = from_runtime(MessageKind::Beacon, Value::Null, None);
        same_context.context = "panel".to_string();
        assert!(c.accept(serde_json::to_value(&same_context).unwrap().into()).is_none());

        let mut own_sender = from_runtime(MessageKind::Beacon, Value::Null, None);
        own_sender.sender = PeerId::from_string("B1");
        assert!(c.accept(serde_json::to_value(&own_sender).unwrap().into()).is_none());
    }

    #[test]
    fn test_rejects_foreign_traffic() {
        let c = panel();
        assert!(c.accept(RawMessage::Text("not json".to_string())).is_none());
        assert!(c.accept(serde_json::json!({"hello": "world"}).into()).is_none());

        let mut unmarked = from_runtime(MessageKind::Beacon, Value::Null, None);
        unmarked.marker = false;
        assert!(c.accept(serde_json::to_value(&unmarked).unwrap().into()).is_none());
    }

    #[test]
    fn test_classify_control_variants() {
        let c = panel();
        let request = from_runtime(
            MessageKind::LostEventsRequest,
            serde_json::json!({"messagesReceived": 2}),
            Some("B1"),
        );
        assert_eq!(
            c.classify(serde_json::to_value(&request).unwrap().into()),
            Some(Inbound::LostEventsRequest {
                sender: PeerId::from_string("A1"),
                messages_received: 2,
            })
        );

        let disconnect = from_runtime(MessageKind::Disconnect, Value::Null, Some("B1"));
        assert!(matches!(
            c.classify(serde_json::to_value(&disconnect).unwrap().into()),
            Some(Inbound::Disconnect { .. })
        ));
    }

    #[test]
    fn test_classify_batch() {
        let c = panel();
        let member = Envelope::new(
            PeerId::from_string("A1"),
            "runtime",
            MessageKind::from("log"),
            serde_json::json!(1),
            Some(PeerId::from_string("B1")),
            1,
        );
        let batch = from_runtime(
            MessageKind::EventBatch,
            serde_json::to_value(vec![member.clone()]).unwrap(),
            Some("B1"),
        );
        match c.classify(serde_json::to_value(&batch).unwrap().into()) {
            Some(Inbound::EventBatch { events, .. }) => assert_eq!(events, vec![member]),
            other => panic!("expected EventBatch, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_control_payload_is_noise() {
        let bad = from_runtime(
            MessageKind::LostEventsRequest,
            serde_json::json!({"count": "many"}),
            Some("B1"),
        );
        assert!(panel().classify(serde_json::to_value(&bad).unwrap().into()).is_none());
    }
}
