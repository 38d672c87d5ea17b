//! Room registry — membership, join/leave, catch-up and idle destruction.
//!
//! DESIGN
//! ======
//! Rooms are created on first join and live in memory only. Joining replies
//! with the current snapshot and the sequence it reflects; because the reply
//! is queued under the room lock, every event the joiner receives afterwards
//! is strictly newer than that base.
//!
//! An empty room is kept for `ROOM_GRACE_MS` so quick reconnects keep their
//! state. Destruction marks the room `destroyed` under its own lock, so a
//! joiner holding a stale handle re-resolves and gets a fresh room instead of
//! joining a corpse.

use std::time::Instant;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::frame::{self, Data, Frame};
use crate::services::{fanout, sequencer, supervisor};
use crate::state::{AppState, Member, Room, RoomHandle};

pub const MAX_ROOM_ID_LEN: usize = 128;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub room_id: String,
    pub base_sequence: u64,
    pub already_member: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MemberInfo {
    pub session_id: Uuid,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RoomStatus {
    pub room_id: String,
    pub members: usize,
    pub last_sequence: u64,
    pub retained_events: usize,
    pub elements: usize,
}

// =============================================================================
// LOOKUP
// =============================================================================

/// Validate a client-supplied room id.
///
/// # Errors
///
/// Returns `InvalidRoomId` for empty, oversized, or control-character ids.
pub fn validate_room_id(raw: &str) -> Result<String, BrokerError> {
    if raw.is_empty() || raw.len() > MAX_ROOM_ID_LEN || raw.chars().any(char::is_control) {
        return Err(BrokerError::InvalidRoomId(raw.to_owned()));
    }
    Ok(raw.to_owned())
}

pub async fn lookup(state: &AppState, room_id: &str) -> Option<RoomHandle> {
    state.rooms.read().await.get(room_id).cloned()
}

async fn lookup_or_create(state: &AppState, room_id: &str) -> RoomHandle {
    if let Some(handle) = lookup(state, room_id).await {
        return handle;
    }
    let mut rooms = state.rooms.write().await;
    rooms
        .entry(room_id.to_owned())
        .or_insert_with(|| {
            info!(%room_id, "room created");
            RoomHandle::new(tokio::sync::Mutex::new(Room::new(room_id, &state.config)))
        })
        .clone()
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Join `room_id`, creating it if needed. The `joined` reply to `request` is
/// queued on the session's delivery queue. Joining the current room again is
/// idempotent; joining a different room leaves the old one first.
///
/// # Errors
///
/// Returns `TransportLost` if the session no longer exists.
pub async fn join(state: &AppState, session_id: Uuid, room_id: &str, request: &Frame) -> Result<Joined, BrokerError> {
    let Some((outbox, identity, previous)) = supervisor::session_route(state, session_id).await else {
        return Err(BrokerError::TransportLost);
    };

    if let Some(previous) = previous.filter(|p| p != room_id) {
        leave(state, session_id, &previous).await;
    }

    loop {
        let handle = lookup_or_create(state, room_id).await;
        let mut room = handle.lock().await;
        if room.destroyed {
            continue;
        }
        let now = Instant::now();

        let already_member = room.members.contains_key(&session_id);
        if !already_member {
            room.members
                .insert(session_id, Member { identity: identity.clone(), outbox: outbox.clone() });
            room.empty_since = None;
            let notice = member_frame(&room.id, session_id, &identity, true);
            fanout::broadcast(&mut room, &notice, Some(session_id), now);
        }

        let base_sequence = room.snapshot.sequence();
        let reply = joined_frame(request, &room);
        fanout::deliver_to(&mut room, session_id, reply, now);

        info!(%room_id, %session_id, members = room.members.len(), base_sequence, already_member, "session joined room");
        let evicted = std::mem::take(&mut room.evicted);
        drop(room);
        supervisor::evict_all(state, &evicted).await;

        if !supervisor::mark_joined(state, session_id, room_id).await {
            // Session terminated while joining; undo the membership.
            leave(state, session_id, room_id).await;
            return Err(BrokerError::TransportLost);
        }
        return Ok(Joined { room_id: room_id.to_owned(), base_sequence, already_member });
    }
}

/// Remove `session_id` from `room_id`. Returns whether it was a member.
pub async fn leave(state: &AppState, session_id: Uuid, room_id: &str) -> bool {
    let Some(handle) = lookup(state, room_id).await else {
        return false;
    };
    let mut room = handle.lock().await;
    let now = Instant::now();
    let Some(member) = room.remove_member(session_id, now) else {
        return false;
    };
    let notice = member_frame(&room.id, session_id, &member.identity, false);
    fanout::broadcast(&mut room, &notice, None, now);

    info!(%room_id, %session_id, remaining = room.members.len(), "session left room");
    let evicted = std::mem::take(&mut room.evicted);
    drop(room);
    supervisor::evict_all(state, &evicted).await;
    true
}

/// Tell remaining members that an evicted session is gone. Returns any
/// members evicted in turn so the caller can keep draining.
pub(crate) async fn announce_departure(state: &AppState, room_id: &str, session_id: Uuid, identity: &str) -> Vec<Uuid> {
    let Some(handle) = lookup(state, room_id).await else {
        return Vec::new();
    };
    let mut room = handle.lock().await;
    let now = Instant::now();
    room.remove_member(session_id, now);
    let notice = member_frame(&room.id, session_id, identity, false);
    fanout::broadcast(&mut room, &notice, None, now);
    std::mem::take(&mut room.evicted)
}

/// Point-in-time membership of a room.
pub async fn members(state: &AppState, room_id: &str) -> Vec<MemberInfo> {
    let Some(handle) = lookup(state, room_id).await else {
        return Vec::new();
    };
    let room = handle.lock().await;
    let mut members: Vec<MemberInfo> = room
        .members
        .iter()
        .map(|(session_id, member)| MemberInfo { session_id: *session_id, identity: member.identity.clone() })
        .collect();
    members.sort_by(|a, b| a.identity.cmp(&b.identity));
    members
}

// =============================================================================
// CATCH-UP
// =============================================================================

/// Queue the events after `since` for a member, or the snapshot if the
/// retained window no longer covers the gap.
///
/// # Errors
///
/// `RoomNotFound` if the session is not a member of `room_id`; `BadRequest`
/// if `since` is ahead of the room.
pub async fn sync(state: &AppState, session_id: Uuid, room_id: &str, since: u64, request: &Frame) -> Result<(), BrokerError> {
    let Some(handle) = lookup(state, room_id).await else {
        return Err(BrokerError::RoomNotFound(room_id.to_owned()));
    };
    let mut room = handle.lock().await;
    if room.destroyed || !room.members.contains_key(&session_id) {
        return Err(BrokerError::RoomNotFound(room_id.to_owned()));
    }
    let last = room.sequencer.last();
    if since > last {
        return Err(BrokerError::BadRequest(format!("since {since} is ahead of room sequence {last}")));
    }

    let mut data = Data::new();
    match room.log.since(since) {
        Some(events) => {
            let events: Vec<Data> = events.iter().map(sequencer::event_data).collect();
            data.insert("events".into(), json!(events));
        }
        None => {
            data.insert("snapshot".into(), room.snapshot.to_json());
            data.insert("base_sequence".into(), json!(room.snapshot.sequence()));
        }
    }
    let mut reply = request.done_with(data);
    reply.room_id = Some(room.id.clone());
    fanout::deliver_to(&mut room, session_id, reply, Instant::now());

    let evicted = std::mem::take(&mut room.evicted);
    drop(room);
    supervisor::evict_all(state, &evicted).await;
    Ok(())
}

pub async fn status(state: &AppState, room_id: &str) -> Option<RoomStatus> {
    let handle = lookup(state, room_id).await?;
    let room = handle.lock().await;
    if room.destroyed {
        return None;
    }
    Some(RoomStatus {
        room_id: room.id.clone(),
        members: room.members.len(),
        last_sequence: room.sequencer.last(),
        retained_events: room.log.len(),
        elements: room.snapshot.len(),
    })
}

// =============================================================================
// DESTRUCTION
// =============================================================================

/// Destroy rooms that have been empty for at least the room grace window.
/// Busy rooms are skipped and re-checked on the next sweep.
pub async fn destroy_idle(state: &AppState, now: Instant) -> Vec<String> {
    let grace = state.config.room_grace;
    let mut rooms = state.rooms.write().await;
    let mut destroyed = Vec::new();

    for (room_id, handle) in rooms.iter() {
        let Ok(mut room) = handle.try_lock() else {
            continue;
        };
        let idle = room.members.is_empty()
            && room
                .empty_since
                .is_some_and(|since| now.saturating_duration_since(since) >= grace);
        if idle {
            room.destroyed = true;
            destroyed.push(room_id.clone());
        }
    }

    for room_id in &destroyed {
        rooms.remove(room_id);
        info!(%room_id, "room destroyed after grace window");
    }
    destroyed
}

// =============================================================================
// FRAMES
// =============================================================================

fn joined_frame(request: &Frame, room: &Room) -> Frame {
    let mut data = Data::new();
    data.insert("room_id".into(), json!(room.id));
    data.insert("snapshot".into(), room.snapshot.to_json());
    data.insert("base_sequence".into(), json!(room.snapshot.sequence()));
    let mut reply = request.done_with(data);
    reply.room_id = Some(room.id.clone());
    reply
}

fn member_frame(room_id: &str, session_id: Uuid, identity: &str, joined: bool) -> Frame {
    let mut data = Data::new();
    data.insert("session_id".into(), json!(session_id));
    data.insert("identity".into(), json!(identity));
    data.insert("joined".into(), json!(joined));
    Frame::request(frame::ROOM_MEMBER, data).with_room_id(room_id)
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
