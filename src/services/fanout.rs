//! Fan-out broadcaster — non-blocking delivery onto per-member queues.
//!
//! DESIGN
//! ======
//! Each session owns one bounded queue of `MEMBER_BACKLOG + 1` frames. Room
//! members hold a clone of its sender. Delivery is `try_send`, so a slow
//! member never delays the others and per-room order is the order of calls
//! made under the room lock.
//!
//! The last slot is reserved for the `session:disconnected` notice. When a
//! member's backlog is full the notice is queued behind everything already
//! pending, the member is removed from the room, and its id is recorded in
//! `Room::evicted` for the caller to terminate once the lock is released.

use std::time::Instant;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

use crate::error::{BrokerError, DisconnectReason};
use crate::frame::{self, Frame};
use crate::state::Room;

/// Result of a single enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Backlog full; the disconnect notice took the reserved slot.
    Overflow,
    /// Receiver is gone; the frame was dropped.
    Closed,
}

/// Queue capacity for a session with the given backlog bound.
#[must_use]
pub fn queue_capacity(backlog: usize) -> usize {
    backlog + 1
}

/// Server notice sent as the final frame before closing a connection.
#[must_use]
pub fn disconnect_frame(reason: DisconnectReason) -> Frame {
    let mut data = match reason {
        DisconnectReason::Backpressure => frame::error_data(&BrokerError::BackpressureExceeded),
    };
    data.insert("reason".into(), serde_json::json!(reason.as_str()));
    Frame::request(frame::SESSION_DISCONNECTED, data)
}

/// Enqueue one frame, enforcing the backlog bound.
pub fn enqueue(outbox: &mpsc::Sender<Frame>, frame: Frame) -> Delivery {
    if outbox.is_closed() {
        return Delivery::Closed;
    }
    if outbox.capacity() <= 1 {
        let _ = outbox.try_send(disconnect_frame(DisconnectReason::Backpressure));
        return Delivery::Overflow;
    }
    match outbox.try_send(frame) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(_)) => {
            let _ = outbox.try_send(disconnect_frame(DisconnectReason::Backpressure));
            Delivery::Overflow
        }
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Deliver `frame` to every member except `exclude`. Members that overflow
/// or whose queue is closed are removed from the room.
pub fn broadcast(room: &mut Room, frame: &Frame, exclude: Option<Uuid>, now: Instant) {
    let mut removed = Vec::new();
    for (session_id, member) in &room.members {
        if exclude == Some(*session_id) {
            continue;
        }
        match enqueue(&member.outbox, frame.clone()) {
            Delivery::Queued => {}
            Delivery::Overflow => removed.push((*session_id, true)),
            Delivery::Closed => removed.push((*session_id, false)),
        }
    }
    apply_removals(room, removed, now);
}

/// Deliver `frame` to one member. No-op if the session is not a member.
pub fn deliver_to(room: &mut Room, session_id: Uuid, frame: Frame, now: Instant) {
    let Some(member) = room.members.get(&session_id) else {
        return;
    };
    match enqueue(&member.outbox, frame) {
        Delivery::Queued => {}
        Delivery::Overflow => apply_removals(room, vec![(session_id, true)], now),
        Delivery::Closed => apply_removals(room, vec![(session_id, false)], now),
    }
}

fn apply_removals(room: &mut Room, removed: Vec<(Uuid, bool)>, now: Instant) {
    for (session_id, overflowed) in removed {
        room.remove_member(session_id, now);
        if overflowed {
            warn!(room_id = %room.id, %session_id, "member backlog exceeded; disconnecting");
            room.evicted.push(session_id);
        }
    }
}

#[cfg(test)]
#[path = "fanout_test.rs"]
mod tests;
