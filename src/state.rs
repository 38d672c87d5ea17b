//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the room registry and the session table. Each room sits behind its
//! own `tokio::sync::Mutex`, which is the single serialization point for
//! sequencing, snapshot folds, retention and fan-out in that room. The
//! registry `RwLock` only guards the id → handle map.
//!
//! LOCK ORDER
//! ==========
//! registry → room is the only nesting allowed, and only for destruction.
//! The session table is never held across a room lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::frame::Frame;
use crate::rate_limit::RateLimiter;
use crate::services::auth::{Authenticator, Identity};
use crate::services::sequencer::Sequencer;
use crate::services::snapshot::{EventLog, Snapshot};
use crate::services::supervisor::Lifecycle;

// =============================================================================
// ROOM
// =============================================================================

/// A room member: the session's label plus a clone of its delivery queue.
pub struct Member {
    pub identity: String,
    pub outbox: mpsc::Sender<Frame>,
}

/// Per-room live state.
pub struct Room {
    pub id: String,
    pub members: HashMap<Uuid, Member>,
    pub sequencer: Sequencer,
    pub log: EventLog,
    pub snapshot: Snapshot,
    /// Set when membership drops to zero; cleared on the next join.
    pub empty_since: Option<Instant>,
    /// Set under the room lock when the registry drops this room. Holders of
    /// a stale handle must re-resolve.
    pub destroyed: bool,
    /// Members removed by fan-out for exceeding their backlog. Drained by the
    /// caller before the room lock is released.
    pub evicted: Vec<Uuid>,
}

impl Room {
    #[must_use]
    pub fn new(id: impl Into<String>, config: &BrokerConfig) -> Self {
        Self {
            id: id.into(),
            members: HashMap::new(),
            sequencer: Sequencer::new(config.idempotency_window),
            log: EventLog::new(config.retained_events),
            snapshot: Snapshot::default(),
            empty_since: None,
            destroyed: false,
            evicted: Vec::new(),
        }
    }

    /// Remove a member, stamping `empty_since` if the room is now empty.
    pub fn remove_member(&mut self, session_id: Uuid, now: Instant) -> Option<Member> {
        let removed = self.members.remove(&session_id);
        if removed.is_some() && self.members.is_empty() {
            self.empty_since = Some(now);
        }
        removed
    }
}

pub type RoomHandle = Arc<Mutex<Room>>;

// =============================================================================
// SESSION
// =============================================================================

/// Supervisor-owned record of one logical session. Survives transport loss
/// for the grace window.
pub struct SessionEntry {
    pub identity: Identity,
    pub lifecycle: Lifecycle,
    pub room_id: Option<String>,
    pub last_seen: Instant,
    /// Sending half of the session's bounded delivery queue.
    pub outbox: mpsc::Sender<Frame>,
    /// Receiving half, parked here while no socket is attached.
    pub inbox: Option<mpsc::Receiver<Frame>>,
    /// Frame taken off the queue whose send failed when the socket dropped.
    /// Delivered ahead of the parked queue on resume.
    pub pending: Option<Frame>,
    /// Incremented on every attach so a stale socket task cannot detach a
    /// resumed session.
    pub connection: u64,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub auth: Arc<Authenticator>,
    pub rooms: Arc<RwLock<HashMap<String, RoomHandle>>>,
    pub sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    #[must_use]
    pub fn new(config: BrokerConfig, auth: Authenticator) -> Self {
        let rate_limiter = RateLimiter::new(config.event_rate_limit, config.event_rate_window);
        Self {
            config: Arc::new(config),
            auth: Arc::new(auth),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            rate_limiter,
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::services::supervisor::{self, Attached};

    pub const TEST_SECRET: &str = "test-secret";

    /// Config with short windows suitable for tests.
    #[must_use]
    pub fn test_config() -> BrokerConfig {
        BrokerConfig {
            grace_window: Duration::from_millis(200),
            room_grace: Duration::from_millis(200),
            member_backlog: 32,
            retained_events: 64,
            ..BrokerConfig::default()
        }
    }

    #[must_use]
    pub fn test_app_state() -> AppState {
        test_app_state_with(test_config())
    }

    #[must_use]
    pub fn test_app_state_with(config: BrokerConfig) -> AppState {
        let auth = Authenticator::new(TEST_SECRET, config.allow_anonymous);
        AppState::new(config, auth)
    }

    /// Open an authenticated session for `subject` and return its attachment.
    pub async fn open_user(state: &AppState, subject: &str) -> Attached {
        supervisor::open(state, Identity::User { subject: subject.into() }).await
    }

    /// Open a session for `subject`, join `room_id` and consume the joined reply.
    pub async fn join_user(state: &AppState, subject: &str, room_id: &str) -> Attached {
        let mut attached = open_user(state, subject).await;
        let request = Frame::request(crate::frame::ROOM_JOIN, crate::frame::Data::new());
        crate::services::room::join(state, attached.session_id, room_id, &request)
            .await
            .expect("join should succeed");
        let reply = recv_frame(&mut attached.inbox).await;
        assert_eq!(reply.parent_id, Some(request.id), "first frame after join must be the joined reply");
        attached
    }

    /// Receive the next queued frame or panic after a short timeout.
    pub async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("frame receive timed out")
            .expect("delivery queue closed unexpectedly")
    }

    /// Assert nothing is queued within a short window.
    pub async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
        assert!(
            timeout(Duration::from_millis(60), rx.recv()).await.is_err(),
            "expected delivery queue to stay empty"
        );
    }

    /// Drain every frame currently queued without waiting.
    pub fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_new_is_empty() {
        let room = Room::new("r1", &BrokerConfig::default());
        assert_eq!(room.id, "r1");
        assert!(room.members.is_empty());
        assert_eq!(room.snapshot.sequence(), 0);
        assert_eq!(room.sequencer.last(), 0);
        assert!(room.empty_since.is_none());
        assert!(!room.destroyed);
    }

    #[test]
    fn removing_last_member_stamps_empty_since() {
        let mut room = Room::new("r1", &BrokerConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        room.members.insert(a, Member { identity: "a".into(), outbox: tx.clone() });
        room.members.insert(b, Member { identity: "b".into(), outbox: tx });

        let now = Instant::now();
        assert!(room.remove_member(a, now).is_some());
        assert!(room.empty_since.is_none());
        assert!(room.remove_member(b, now).is_some());
        assert_eq!(room.empty_since, Some(now));
    }

    #[test]
    fn removing_unknown_member_is_noop() {
        let mut room = Room::new("r1", &BrokerConfig::default());
        assert!(room.remove_member(Uuid::new_v4(), Instant::now()).is_none());
        assert!(room.empty_since.is_none());
    }
}
