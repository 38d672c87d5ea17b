//! Connection supervisor — session lifecycle, grace windows and eviction.
//!
//! DESIGN
//! ======
//! A session outlives its socket. When the transport drops, the socket task
//! parks the receiving half of the delivery queue in the session table and
//! the session stays a room member, so frames keep queueing (up to the
//! backlog bound) for the grace window. A reconnect that presents the same
//! identity and `resume=<session_id>` takes the receiver back and drains
//! whatever queued in the meantime. After the window, the sweeper terminates
//! the session and removes it from its room.
//!
//! LIFECYCLE
//! =========
//! Connecting → Authenticated | Terminated
//! Authenticated → Active | Disconnected | Terminated
//! Active → Authenticated | Disconnected | Terminated
//! Disconnected → Active | Authenticated | Terminated
//!
//! Only the routes layer observes `Connecting`; a session is created already
//! authenticated.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::services::auth::Identity;
use crate::services::{fanout, room};
use crate::state::{AppState, SessionEntry};

// =============================================================================
// LIFECYCLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Connecting,
    Authenticated,
    Active,
    Disconnected,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: Lifecycle,
    pub to: Lifecycle,
}

impl Lifecycle {
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use Lifecycle::{Active, Authenticated, Connecting, Disconnected, Terminated};
        matches!(
            (self, to),
            (Connecting, Authenticated | Terminated)
                | (Authenticated, Active | Disconnected | Terminated)
                | (Active, Authenticated | Disconnected | Terminated)
                | (Disconnected, Active | Authenticated | Terminated)
        )
    }

    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for any edge not in the lifecycle graph.
    pub fn transition(self, to: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

fn advance(entry: &mut SessionEntry, session_id: Uuid, to: Lifecycle) -> bool {
    match entry.lifecycle.transition(to) {
        Ok(next) => {
            debug!(%session_id, from = ?entry.lifecycle, to = ?next, "lifecycle");
            entry.lifecycle = next;
            true
        }
        Err(e) => {
            warn!(%session_id, error = %e, "lifecycle transition refused");
            false
        }
    }
}

// =============================================================================
// ATTACH / DETACH
// =============================================================================

/// A socket's claim on a session: the receiving half of its delivery queue.
#[derive(Debug)]
pub struct Attached {
    pub session_id: Uuid,
    pub inbox: mpsc::Receiver<Frame>,
    pub connection: u64,
    pub resumed: bool,
    /// Must be sent before anything from `inbox`.
    pub pending: Option<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResumeRejected {
    #[error("unknown session")]
    Unknown,
    #[error("session is still attached")]
    NotDisconnected,
    #[error("identity does not match session")]
    IdentityMismatch,
    #[error("anonymous sessions cannot resume")]
    Anonymous,
    #[error("grace window expired")]
    Expired,
}

/// Create a fresh authenticated session.
pub async fn open(state: &AppState, identity: Identity) -> Attached {
    let session_id = Uuid::new_v4();
    let (outbox, inbox) = mpsc::channel(fanout::queue_capacity(state.config.member_backlog));
    info!(%session_id, identity = %identity.label(), "session authenticated");

    state.sessions.write().await.insert(
        session_id,
        SessionEntry {
            identity,
            lifecycle: Lifecycle::Authenticated,
            room_id: None,
            last_seen: Instant::now(),
            outbox,
            inbox: None,
            pending: None,
            connection: 1,
        },
    );
    Attached { session_id, inbox, connection: 1, resumed: false, pending: None }
}

/// Reattach a disconnected session within its grace window.
///
/// # Errors
///
/// Returns why the session cannot be resumed; the caller opens a new one.
/// An expired session is terminated on the spot.
pub async fn resume(
    state: &AppState,
    session_id: Uuid,
    identity: &Identity,
    now: Instant,
) -> Result<Attached, ResumeRejected> {
    if identity.is_anonymous() {
        return Err(ResumeRejected::Anonymous);
    }

    let mut sessions = state.sessions.write().await;
    let Some(entry) = sessions.get_mut(&session_id) else {
        return Err(ResumeRejected::Unknown);
    };
    if entry.identity != *identity {
        return Err(ResumeRejected::IdentityMismatch);
    }
    if entry.lifecycle != Lifecycle::Disconnected {
        return Err(ResumeRejected::NotDisconnected);
    }
    if now.saturating_duration_since(entry.last_seen) > state.config.grace_window {
        let expired = sessions.remove(&session_id);
        drop(sessions);
        if let Some(entry) = expired {
            finish(state, session_id, entry, "grace window expired").await;
        }
        return Err(ResumeRejected::Expired);
    }
    let Some(inbox) = entry.inbox.take() else {
        return Err(ResumeRejected::NotDisconnected);
    };

    let next = if entry.room_id.is_some() { Lifecycle::Active } else { Lifecycle::Authenticated };
    advance(entry, session_id, next);
    entry.connection += 1;
    entry.last_seen = now;
    let pending = entry.pending.take();
    info!(%session_id, room_id = ?entry.room_id, queued = inbox.len() + usize::from(pending.is_some()), "session resumed");
    Ok(Attached { session_id, inbox, connection: entry.connection, resumed: true, pending })
}

/// Park the delivery queue after transport loss, along with any frame that
/// was dequeued but not sent. Ignored if another connection has since
/// claimed the session.
pub async fn detach(
    state: &AppState,
    session_id: Uuid,
    connection: u64,
    inbox: mpsc::Receiver<Frame>,
    unsent: Option<Frame>,
    now: Instant,
) {
    let mut sessions = state.sessions.write().await;
    let Some(entry) = sessions.get_mut(&session_id) else {
        return;
    };
    if entry.connection != connection {
        return;
    }
    if advance(entry, session_id, Lifecycle::Disconnected) {
        entry.inbox = Some(inbox);
        entry.pending = unsent;
        entry.last_seen = now;
        info!(%session_id, room_id = ?entry.room_id, "transport lost; holding session for grace window");
    }
}

pub async fn touch(state: &AppState, session_id: Uuid, now: Instant) {
    if let Some(entry) = state.sessions.write().await.get_mut(&session_id) {
        entry.last_seen = now;
    }
}

// =============================================================================
// ROUTING HELPERS
// =============================================================================

/// Delivery queue, identity label and current room for a live session.
pub async fn session_route(state: &AppState, session_id: Uuid) -> Option<(mpsc::Sender<Frame>, String, Option<String>)> {
    let sessions = state.sessions.read().await;
    let entry = sessions.get(&session_id)?;
    Some((entry.outbox.clone(), entry.identity.label(), entry.room_id.clone()))
}

pub async fn current_room(state: &AppState, session_id: Uuid) -> Option<String> {
    state
        .sessions
        .read()
        .await
        .get(&session_id)
        .and_then(|entry| entry.room_id.clone())
}

pub async fn lifecycle(state: &AppState, session_id: Uuid) -> Option<Lifecycle> {
    state
        .sessions
        .read()
        .await
        .get(&session_id)
        .map(|entry| entry.lifecycle)
}

/// Record a completed join. Returns false if the session is gone.
pub(crate) async fn mark_joined(state: &AppState, session_id: Uuid, room_id: &str) -> bool {
    let mut sessions = state.sessions.write().await;
    let Some(entry) = sessions.get_mut(&session_id) else {
        return false;
    };
    if entry.lifecycle == Lifecycle::Authenticated {
        advance(entry, session_id, Lifecycle::Active);
    }
    entry.room_id = Some(room_id.to_owned());
    true
}

/// Record an explicit leave.
pub(crate) async fn mark_left(state: &AppState, session_id: Uuid) {
    let mut sessions = state.sessions.write().await;
    if let Some(entry) = sessions.get_mut(&session_id) {
        if entry.lifecycle == Lifecycle::Active {
            advance(entry, session_id, Lifecycle::Authenticated);
        }
        entry.room_id = None;
    }
}

// =============================================================================
// TERMINATION
// =============================================================================

/// Remove a session and its room membership. Returns false if it was
/// already gone.
pub async fn terminate(state: &AppState, session_id: Uuid, reason: &str) -> bool {
    let Some(entry) = state.sessions.write().await.remove(&session_id) else {
        return false;
    };
    finish(state, session_id, entry, reason).await;
    true
}

async fn finish(state: &AppState, session_id: Uuid, entry: SessionEntry, reason: &str) {
    state.rate_limiter.forget(session_id);
    info!(%session_id, from = ?entry.lifecycle, %reason, "session terminated");
    if let Some(room_id) = entry.room_id {
        room::leave(state, session_id, &room_id).await;
    }
}

/// Terminate sessions that fan-out removed for exceeding their backlog.
/// Departure notices can overflow further members, so this drains until no
/// evictions remain.
pub async fn evict_all(state: &AppState, evicted: &[Uuid]) {
    let mut pending = evicted.to_vec();
    while let Some(session_id) = pending.pop() {
        let Some(entry) = state.sessions.write().await.remove(&session_id) else {
            continue;
        };
        state.rate_limiter.forget(session_id);
        warn!(%session_id, from = ?entry.lifecycle, "session evicted for backpressure");

        if let Some(room_id) = entry.room_id {
            let label = entry.identity.label();
            pending.extend(room::announce_departure(state, &room_id, session_id, &label).await);
        }
    }
}

/// Terminate every disconnected session whose grace window has elapsed.
pub async fn reap_expired(state: &AppState, now: Instant) -> Vec<Uuid> {
    let grace = state.config.grace_window;
    let expired: Vec<(Uuid, SessionEntry)> = {
        let mut sessions = state.sessions.write().await;
        let ids: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, entry)| {
                entry.lifecycle == Lifecycle::Disconnected && now.saturating_duration_since(entry.last_seen) >= grace
            })
            .map(|(session_id, _)| *session_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
            .collect()
    };

    let mut reaped = Vec::with_capacity(expired.len());
    for (session_id, entry) in expired {
        finish(state, session_id, entry, "grace window expired").await;
        reaped.push(session_id);
    }
    reaped
}

/// Periodically reap expired sessions and destroy idle rooms.
pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    let period = state.config.sweep_interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let reaped = reap_expired(&state, now).await;
            let destroyed = room::destroy_idle(&state, now).await;
            if !reaped.is_empty() || !destroyed.is_empty() {
                debug!(reaped = reaped.len(), destroyed = destroyed.len(), "sweep");
            }
        }
    })
}

#[cfg(test)]
#[path = "supervisor_test.rs"]
mod tests;
