//! Gap recovery: lost-events requests and the replay batches answering
//! them.
//!
//! Every connection remembers which Outbound Log entry each of its sequence
//! numbers stands for, so a replay re-sends exactly what that peer was sent
//! under the same numbers. Broadcasts and traffic for other peers never
//! enter another peer's replay.

use serde_json::Value;
use tracing::debug;

use crate::error::MessengerError;
use crate::identity::PeerId;
use crate::message::{Envelope, LocalPeer, LostEventsRequest, MessageKind};
use crate::registry::InstanceState;

/// Ask `peer` to resend everything after the first `messages_received`
/// events.
pub fn lost_events_request(local: &LocalPeer, peer: &PeerId, messages_received: u64) -> Envelope {
    let payload = serde_json::to_value(LostEventsRequest { messages_received })
        .unwrap_or(Value::Null);
    local.control(MessageKind::LostEventsRequest, payload, Some(peer.clone()))
}

/// Package everything sent to `peer` after its first `start` sequences into
/// one `event-batch`, renumbered exactly as first sent.
///
/// Returns `None` when there is nothing to replay.
pub fn replay_batch(
    state: &InstanceState,
    local: &LocalPeer,
    peer: &PeerId,
    start: usize,
) -> Result<Option<Envelope>, MessengerError> {
    let Some(connection) = state.connections.get(peer) else {
        return Ok(None);
    };
    let events: Vec<Envelope> = connection
        .sent_since(start)
        .iter()
        .zip(start + 1..)
        .filter_map(|(&index, sequence)| {
            state.log.get(index).map(|event| {
                local.envelope(
                    MessageKind::from(event.kind.as_str()),
                    event.payload.clone(),
                    Some(peer.clone()),
                    sequence as i64,
                )
            })
        })
        .collect();
    if events.is_empty() {
        return Ok(None);
    }

    let payload = serde_json::to_value(&events)?;
    Ok(Some(local.control(
        MessageKind::EventBatch,
        payload,
        Some(peer.clone()),
    )))
}

/// Bind a newly seen `peer` to every logged event meant for it (broadcasts
/// and events addressed to it) and package them as its first batch.
pub fn bootstrap_batch(
    state: &mut InstanceState,
    local: &LocalPeer,
    peer: &PeerId,
) -> Result<Option<Envelope>, MessengerError> {
    let meant_for_peer: Vec<usize> = state
        .log
        .iter()
        .enumerate()
        .filter(|(_, event)| event.target.as_ref().is_none_or(|target| target == peer))
        .map(|(index, _)| index)
        .collect();

    let connection = state.connections.get_or_create(peer);
    let start = connection.log_indices.len();
    for index in meant_for_peer {
        connection.next_sequence(index);
    }
    replay_batch(state, local, peer, start)
}

/// Answer a lost-events request from `peer`.
///
/// The replay starts after the count the requester reports, clamped to what
/// was sent to it. Our own `messages_sent` only feeds a divergence log line.
pub fn handle_lost_events_request(
    state: &InstanceState,
    local: &LocalPeer,
    peer: &PeerId,
    messages_received: u64,
    verbose: bool,
) -> Result<Option<Envelope>, MessengerError> {
    let Some(connection) = state.connections.get(peer) else {
        if verbose {
            debug!("Ignoring lost-events request from unknown peer {peer}");
        }
        return Ok(None);
    };

    if verbose && connection.messages_sent != messages_received {
        debug!(
            "Peer {peer} reports {messages_received} received, we marked {} sent",
            connection.messages_sent
        );
    }

    let sent = connection.log_indices.len();
    let start = usize::try_from(messages_received)
        .unwrap_or(usize::MAX)
        .min(sent);
    let batch = replay_batch(state, local, peer, start)?;
    if verbose {
        match &batch {
            Some(_) => debug!("Replaying {} events to {peer} from seq {}", sent - start, start + 1),
            None => debug!("Nothing to replay to {peer} past seq {start}"),
        }
    }
    Ok(batch)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutboundEvent;

    fn runtime() -> LocalPeer {
        LocalPeer::new(PeerId::from_string("A1"), "runtime")
    }

    /// Log `event` and record it against its target, as `send` does.
    fn log(state: &mut InstanceState, event: OutboundEvent) {
        let target = event.target.clone();
        let index = state.log.append(event);
        if let Some(peer) = target {
            state.connections.get_or_create(&peer).next_sequence(index);
        }
    }

    fn state_with(n: u64, peer: &PeerId) -> InstanceState {
        let mut state = InstanceState::default();
        for i in 1..=n {
            log(&mut state, OutboundEvent::to(peer.clone(), "log", serde_json::json!(i)));
        }
        state
    }

    fn members(batch: &Envelope) -> Vec<Envelope> {
        serde_json::from_value(batch.payload.clone()).unwrap()
    }

    #[test]
    fn test_request_shape() {
        let b1 = PeerId::from_string("B1");
        let request = lost_events_request(&runtime(), &b1, 1);
        assert_eq!(request.kind, MessageKind::LostEventsRequest);
        assert_eq!(request.target, Some(b1));
        assert_eq!(request.sequence(), None);
        assert_eq!(request.payload, serde_json::json!({"messagesReceived": 1}));
    }

    #[test]
    fn test_replay_from_reported_count() {
        let b1 = PeerId::from_string("B1");
        let state = state_with(3, &b1);

        let batch = handle_lost_events_request(&state, &runtime(), &b1, 1, true)
            .unwrap()
            .expect("batch");
        assert_eq!(batch.kind, MessageKind::EventBatch);
        assert_eq!(batch.target, Some(b1.clone()));

        let events = members(&batch);
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, [2, 3]);
        assert_eq!(events[0].payload, serde_json::json!(2));
        assert!(events.iter().all(|e| e.target.as_ref() == Some(&b1)));
        assert_eq!(state.connections.get(&b1).unwrap().messages_sent, 3);
    }

    #[test]
    fn test_replay_skips_broadcasts_and_other_peers() {
        let b1 = PeerId::from_string("B1");
        let c1 = PeerId::from_string("C1");
        let mut state = InstanceState::default();
        log(&mut state, OutboundEvent::new("status", serde_json::json!("up")));
        log(&mut state, OutboundEvent::to(b1.clone(), "log", serde_json::json!("b1")));
        log(&mut state, OutboundEvent::to(c1.clone(), "log", serde_json::json!("c1")));
        log(&mut state, OutboundEvent::to(b1.clone(), "log", serde_json::json!("b2")));
        log(&mut state, OutboundEvent::to(b1.clone(), "log", serde_json::json!("b3")));

        let batch = handle_lost_events_request(&state, &runtime(), &b1, 1, false)
            .unwrap()
            .expect("batch");
        let events = members(&batch);
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
        let payloads: Vec<serde_json::Value> = events.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(sequences, [2, 3]);
        assert_eq!(payloads, [serde_json::json!("b2"), serde_json::json!("b3")]);
    }

    #[test]
    fn test_unknown_peer_is_ignored() {
        let b1 = PeerId::from_string("B1");
        let state = state_with(2, &b1);
        let stranger = PeerId::from_string("C3");
        let reply = handle_lost_events_request(&state, &runtime(), &stranger, 0, false).unwrap();
        assert!(reply.is_none());
        assert!(!state.connections.contains(&stranger));
    }

    #[test]
    fn test_nothing_sent_is_ignored() {
        let b1 = PeerId::from_string("B1");
        let mut state = InstanceState::default();
        state.connections.get_or_create(&b1);
        log(&mut state, OutboundEvent::new("status", serde_json::json!(1)));
        assert!(
            handle_lost_events_request(&state, &runtime(), &b1, 0, false)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_report_past_sent_count_replays_nothing() {
        let b1 = PeerId::from_string("B1");
        let state = state_with(2, &b1);
        let reply = handle_lost_events_request(&state, &runtime(), &b1, 9, false).unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn test_bootstrap_covers_broadcasts_and_own_events() {
        let b1 = PeerId::from_string("B1");
        let c1 = PeerId::from_string("C1");
        let mut state = InstanceState::default();
        log(&mut state, OutboundEvent::new("boot", serde_json::json!(1)));
        log(&mut state, OutboundEvent::to(c1.clone(), "log", serde_json::json!(2)));
        log(&mut state, OutboundEvent::new("ready", serde_json::json!(3)));

        let batch = bootstrap_batch(&mut state, &runtime(), &b1).unwrap().unwrap();
        let events = members(&batch);
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, [1, 2]);
        assert_eq!(events[1].kind, MessageKind::from("ready"));

        let connection = state.connections.get(&b1).unwrap();
        assert_eq!(connection.messages_sent, 2);
        assert_eq!(connection.log_indices, [0, 2]);
    }
}
