//! Event sequencer — per-room gapless sequence numbers and deduplication.
//!
//! DESIGN
//! ======
//! Every submission to a room passes through `commit` while the caller holds
//! that room's lock, so allocation, snapshot fold, retention and fan-out
//! enqueue happen as one step. Two events in a room never share a number and
//! members never observe a gap. Rooms are independent.
//!
//! ERROR HANDLING
//! ==============
//! A fold rejection after allocation means the sequencer and snapshot have
//! diverged. The room is reset to its last good snapshot (sequencer rewound,
//! newer retained events dropped) and every member receives `room:resync`.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::frame::{self, Data, Frame};
use crate::services::snapshot::{FoldError, FoldOp};
use crate::services::{fanout, room, supervisor};
use crate::state::{AppState, Room};

// =============================================================================
// TYPES
// =============================================================================

/// A drawing operation after the sequencer has stamped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub room_id: String,
    pub sequence: u64,
    pub originator: Uuid,
    pub identity: String,
    pub payload: serde_json::Value,
    /// Client logical timestamp. Advisory only.
    pub client_ts: Option<i64>,
}

/// Inbound event fields taken from an `event:submit` frame.
#[derive(Debug, Clone)]
pub struct Submission {
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub client_ts: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub sequence: u64,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Fresh(u64),
    Duplicate(u64),
}

// =============================================================================
// SEQUENCER
// =============================================================================

/// Sequence counter plus a bounded window of idempotency keys.
#[derive(Debug)]
pub struct Sequencer {
    last: u64,
    keys: HashMap<(Uuid, String), u64>,
    order: VecDeque<(Uuid, String)>,
    window: usize,
}

impl Sequencer {
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self { last: 0, keys: HashMap::new(), order: VecDeque::new(), window: window.max(1) }
    }

    /// Last allocated sequence (0 before the first event).
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Allocate the next number, or return the one already assigned to this
    /// originator's idempotency key.
    pub fn allocate(&mut self, originator: Uuid, key: Option<&str>) -> Allocation {
        if let Some(key) = key {
            if let Some(&sequence) = self.keys.get(&(originator, key.to_owned())) {
                return Allocation::Duplicate(sequence);
            }
        }

        self.last += 1;
        if let Some(key) = key {
            let entry = (originator, key.to_owned());
            self.keys.insert(entry.clone(), self.last);
            self.order.push_back(entry);
            while self.order.len() > self.window {
                if let Some(oldest) = self.order.pop_front() {
                    self.keys.remove(&oldest);
                }
            }
        }
        Allocation::Fresh(self.last)
    }

    /// Roll back to `sequence`, forgetting keys for anything after it.
    pub fn rewind(&mut self, sequence: u64) {
        self.last = sequence;
        self.keys.retain(|_, assigned| *assigned <= sequence);
        let keys = &self.keys;
        self.order.retain(|entry| keys.contains_key(entry));
    }
}

// =============================================================================
// SUBMIT
// =============================================================================

/// Submit an event from `session_id` into its current room.
///
/// # Errors
///
/// `RoomNotFound` if the session has not joined a live room;
/// `SequenceConflict` if the room had to be reset.
pub async fn submit(
    state: &AppState,
    session_id: Uuid,
    request: &Frame,
    submission: Submission,
) -> Result<Submitted, BrokerError> {
    let room_id = {
        let sessions = state.sessions.read().await;
        sessions
            .get(&session_id)
            .and_then(|s| s.room_id.clone())
    };
    let Some(room_id) = room_id else {
        return Err(BrokerError::RoomNotFound("no room joined".into()));
    };
    let Some(handle) = room::lookup(state, &room_id).await else {
        return Err(BrokerError::RoomNotFound(room_id));
    };

    let mut room = handle.lock().await;
    if room.destroyed {
        return Err(BrokerError::RoomNotFound(room_id));
    }
    let result = commit(&mut room, session_id, request, submission, state.config.echo_to_originator, Instant::now());
    let evicted = std::mem::take(&mut room.evicted);
    drop(room);

    supervisor::evict_all(state, &evicted).await;
    result
}

/// Sequence, fold, retain and fan out one event. Caller holds the room lock.
///
/// # Errors
///
/// See [`submit`].
pub fn commit(
    room: &mut Room,
    originator: Uuid,
    request: &Frame,
    submission: Submission,
    echo_to_originator: bool,
    now: Instant,
) -> Result<Submitted, BrokerError> {
    let Some(member) = room.members.get(&originator) else {
        return Err(BrokerError::RoomNotFound(room.id.clone()));
    };
    let identity = member.identity.clone();

    let sequence = match room
        .sequencer
        .allocate(originator, submission.idempotency_key.as_deref())
    {
        Allocation::Duplicate(sequence) => {
            info!(room_id = %room.id, %originator, sequence, "duplicate submission collapsed");
            let ack = ack_frame(request, &room.id, sequence, true);
            fanout::deliver_to(room, originator, ack, now);
            return Ok(Submitted { sequence, duplicate: true });
        }
        Allocation::Fresh(sequence) => sequence,
    };

    let event = SequencedEvent {
        room_id: room.id.clone(),
        sequence,
        originator,
        identity,
        payload: submission.payload,
        client_ts: submission.client_ts,
    };

    match room.snapshot.fold(&event) {
        Ok(op) => {
            room.log.push(event.clone());
            if op == FoldOp::Clear {
                room.log.compact_before(sequence);
            }
        }
        Err(FoldError::OutOfOrder { expected, got }) => {
            error!(room_id = %room.id, expected, got, "sequence conflict; resetting room from snapshot");
            reset_room(room, now);
            return Err(BrokerError::SequenceConflict { room_id: room.id.clone(), expected, got });
        }
    }

    let notice = event_frame(&event);
    let exclude = if echo_to_originator { None } else { Some(originator) };
    fanout::broadcast(room, &notice, exclude, now);
    let ack = ack_frame(request, &room.id, sequence, false);
    fanout::deliver_to(room, originator, ack, now);

    Ok(Submitted { sequence, duplicate: false })
}

/// Rewind the room to its last good snapshot and tell every member.
pub fn reset_room(room: &mut Room, now: Instant) {
    let good = room.snapshot.sequence();
    room.sequencer.rewind(good);
    room.log.truncate_after(good);

    let mut data = Data::new();
    data.insert("snapshot".into(), room.snapshot.to_json());
    data.insert("base_sequence".into(), json!(good));
    let notice = Frame::request(frame::ROOM_RESYNC, data).with_room_id(room.id.clone());
    fanout::broadcast(room, &notice, None, now);
}

// =============================================================================
// FRAMES
// =============================================================================

/// Wire fields of a sequenced event, shared by live notices and sync replay.
#[must_use]
pub fn event_data(event: &SequencedEvent) -> Data {
    let mut data = Data::new();
    data.insert("sequence".into(), json!(event.sequence));
    data.insert("originator".into(), json!(event.originator));
    data.insert("identity".into(), json!(event.identity));
    data.insert("payload".into(), event.payload.clone());
    data.insert("client_ts".into(), json!(event.client_ts));
    data
}

/// Outbound `room:event` notice for a sequenced event.
#[must_use]
pub fn event_frame(event: &SequencedEvent) -> Frame {
    Frame::request(frame::ROOM_EVENT, event_data(event))
        .with_room_id(event.room_id.clone())
        .with_from(event.identity.clone())
}

fn ack_frame(request: &Frame, room_id: &str, sequence: u64, duplicate: bool) -> Frame {
    let mut data = Data::new();
    data.insert("sequence".into(), json!(sequence));
    data.insert("duplicate".into(), json!(duplicate));
    let mut ack = request.done_with(data);
    ack.room_id = Some(room_id.to_owned());
    ack
}

#[cfg(test)]
#[path = "sequencer_test.rs"]
mod tests;
