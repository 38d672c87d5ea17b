use super::*;
use crate::config::BrokerConfig;
use crate::frame::{self, Data};
use crate::services::sequencer::{self, Submission};
use crate::state::test_helpers::{self, drain, join_user, open_user, recv_frame};

fn user(subject: &str) -> Identity {
    Identity::User { subject: subject.into() }
}

async fn submit_id(state: &AppState, session_id: Uuid, id: &str) {
    let request = Frame::request(frame::EVENT_SUBMIT, Data::new());
    let payload = serde_json::json!({"id": id});
    sequencer::submit(state, session_id, &request, Submission { payload, idempotency_key: None, client_ts: None })
        .await
        .unwrap();
}

/// Detach `attached` as if its socket dropped.
async fn drop_transport(state: &AppState, attached: Attached) -> Uuid {
    let Attached { session_id, inbox, connection, .. } = attached;
    detach(state, session_id, connection, inbox, None, Instant::now()).await;
    session_id
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[test]
fn lifecycle_allows_documented_edges() {
    use Lifecycle::{Active, Authenticated, Connecting, Disconnected, Terminated};
    let allowed = [
        (Connecting, Authenticated),
        (Connecting, Terminated),
        (Authenticated, Active),
        (Authenticated, Disconnected),
        (Authenticated, Terminated),
        (Active, Authenticated),
        (Active, Disconnected),
        (Active, Terminated),
        (Disconnected, Active),
        (Disconnected, Authenticated),
        (Disconnected, Terminated),
    ];
    let all = [Connecting, Authenticated, Active, Disconnected, Terminated];
    for from in all {
        for to in all {
            let expected = allowed.contains(&(from, to));
            assert_eq!(from.can_transition(to), expected, "{from:?} -> {to:?}");
        }
    }
}

#[test]
fn terminated_is_final() {
    let err = Lifecycle::Terminated.transition(Lifecycle::Active).unwrap_err();
    assert_eq!(err, InvalidTransition { from: Lifecycle::Terminated, to: Lifecycle::Active });
    assert_eq!(Lifecycle::Connecting.transition(Lifecycle::Authenticated), Ok(Lifecycle::Authenticated));
}

// =============================================================================
// OPEN / RESUME
// =============================================================================

#[tokio::test]
async fn open_registers_authenticated_session() {
    let state = test_helpers::test_app_state();
    let alice = open_user(&state, "alice").await;
    assert!(!alice.resumed);
    assert_eq!(alice.connection, 1);
    assert_eq!(lifecycle(&state, alice.session_id).await, Some(Lifecycle::Authenticated));
    assert!(current_room(&state, alice.session_id).await.is_none());
}

#[tokio::test]
async fn resume_within_grace_delivers_frames_queued_while_away() {
    let state = test_helpers::test_app_state();
    let mut alice = join_user(&state, "alice", "r1").await;
    let bob = join_user(&state, "bob", "r1").await;
    drain(&mut alice.inbox);

    let bob_id = drop_transport(&state, bob).await;
    assert_eq!(lifecycle(&state, bob_id).await, Some(Lifecycle::Disconnected));

    submit_id(&state, alice.session_id, "a").await;
    submit_id(&state, alice.session_id, "b").await;

    let mut bob = resume(&state, bob_id, &user("bob"), Instant::now()).await.unwrap();
    assert!(bob.resumed);
    assert_eq!(bob.connection, 2);
    assert_eq!(lifecycle(&state, bob_id).await, Some(Lifecycle::Active));

    let first = recv_frame(&mut bob.inbox).await;
    let second = recv_frame(&mut bob.inbox).await;
    assert_eq!(first.data["sequence"], 1);
    assert_eq!(second.data["sequence"], 2);

    // Membership never lapsed, so peers saw no departure.
    let syscalls: Vec<String> = drain(&mut alice.inbox).into_iter().map(|f| f.syscall).collect();
    assert!(!syscalls.iter().any(|s| s == frame::ROOM_MEMBER));
}

#[tokio::test]
async fn unsent_frame_is_redelivered_first_on_resume() {
    let state = test_helpers::test_app_state();
    let alice = join_user(&state, "alice", "r1").await;
    let mut bob = join_user(&state, "bob", "r1").await;
    drain(&mut bob.inbox);

    submit_id(&state, alice.session_id, "a").await;
    submit_id(&state, alice.session_id, "b").await;

    // The socket task took seq 1 off the queue, then the send failed.
    let unsent = recv_frame(&mut bob.inbox).await;
    assert_eq!(unsent.data["sequence"], 1);
    let Attached { session_id: bob_id, inbox, connection, .. } = bob;
    detach(&state, bob_id, connection, inbox, Some(unsent), Instant::now()).await;

    submit_id(&state, alice.session_id, "c").await;

    let mut bob = resume(&state, bob_id, &user("bob"), Instant::now()).await.unwrap();
    let first = bob.pending.take().expect("unsent frame handed back");
    assert_eq!(first.data["sequence"], 1);
    assert_eq!(recv_frame(&mut bob.inbox).await.data["sequence"], 2);
    assert_eq!(recv_frame(&mut bob.inbox).await.data["sequence"], 3);

    // Handed over exactly once.
    drop_transport(&state, bob).await;
    let again = resume(&state, bob_id, &user("bob"), Instant::now()).await.unwrap();
    assert!(again.pending.is_none());
}

#[tokio::test]
async fn resume_rejections() {
    let state = test_helpers::test_app_state();
    let alice = open_user(&state, "alice").await;
    let now = Instant::now();

    assert_eq!(
        resume(&state, Uuid::new_v4(), &user("alice"), now).await.unwrap_err(),
        ResumeRejected::Unknown
    );
    assert_eq!(
        resume(&state, alice.session_id, &user("alice"), now).await.unwrap_err(),
        ResumeRejected::NotDisconnected
    );

    let alice_id = drop_transport(&state, alice).await;
    assert_eq!(
        resume(&state, alice_id, &user("mallory"), now).await.unwrap_err(),
        ResumeRejected::IdentityMismatch
    );
    let anonymous = Identity::Anonymous { id: Uuid::new_v4() };
    assert_eq!(resume(&state, alice_id, &anonymous, now).await.unwrap_err(), ResumeRejected::Anonymous);

    assert_eq!(lifecycle(&state, alice_id).await, Some(Lifecycle::Disconnected));
}

#[tokio::test]
async fn resume_after_grace_terminates_session() {
    let state = test_helpers::test_app_state();
    let mut alice = join_user(&state, "alice", "r1").await;
    let bob = join_user(&state, "bob", "r1").await;
    drain(&mut alice.inbox);
    let bob_id = drop_transport(&state, bob).await;

    let late = Instant::now() + state.config.grace_window + Duration::from_millis(10);
    assert_eq!(resume(&state, bob_id, &user("bob"), late).await.unwrap_err(), ResumeRejected::Expired);
    assert!(lifecycle(&state, bob_id).await.is_none());

    let departure = recv_frame(&mut alice.inbox).await;
    assert_eq!(departure.syscall, frame::ROOM_MEMBER);
    assert_eq!(departure.data["joined"], false);
}

#[tokio::test]
async fn stale_connection_cannot_detach_resumed_session() {
    let state = test_helpers::test_app_state();
    let alice = open_user(&state, "alice").await;
    let alice_id = drop_transport(&state, alice).await;
    let resumed = resume(&state, alice_id, &user("alice"), Instant::now()).await.unwrap();

    let (_tx, stale_inbox) = mpsc::channel(1);
    detach(&state, alice_id, 1, stale_inbox, None, Instant::now()).await;
    assert_eq!(lifecycle(&state, alice_id).await, Some(Lifecycle::Authenticated));

    drop_transport(&state, resumed).await;
    assert_eq!(lifecycle(&state, alice_id).await, Some(Lifecycle::Disconnected));
}

// =============================================================================
// TERMINATION
// =============================================================================

#[tokio::test]
async fn reap_expired_only_takes_sessions_past_grace() {
    let state = test_helpers::test_app_state();
    let mut alice = join_user(&state, "alice", "r1").await;
    let bob = join_user(&state, "bob", "r1").await;
    drain(&mut alice.inbox);
    let bob_id = drop_transport(&state, bob).await;

    assert!(reap_expired(&state, Instant::now()).await.is_empty());
    let later = Instant::now() + state.config.grace_window + Duration::from_millis(10);
    assert_eq!(reap_expired(&state, later).await, vec![bob_id]);

    assert!(lifecycle(&state, bob_id).await.is_none());
    assert!(lifecycle(&state, alice.session_id).await.is_some());
    assert_eq!(recv_frame(&mut alice.inbox).await.data["identity"], "bob");
}

#[tokio::test]
async fn terminate_forgets_rate_limit_state() {
    let state = test_helpers::test_app_state();
    let alice = join_user(&state, "alice", "r1").await;
    state.rate_limiter.check_and_record(alice.session_id).unwrap();
    assert_eq!(state.rate_limiter.tracked_sessions(), 1);

    assert!(terminate(&state, alice.session_id, "test").await);
    assert_eq!(state.rate_limiter.tracked_sessions(), 0);
    assert!(!terminate(&state, alice.session_id, "test").await);
    assert!(crate::services::room::members(&state, "r1").await.is_empty());
}

#[tokio::test]
async fn sweeper_reaps_sessions_and_destroys_rooms() {
    let state = test_helpers::test_app_state_with(BrokerConfig {
        grace_window: Duration::from_millis(40),
        room_grace: Duration::from_millis(40),
        sweep_interval: Duration::from_millis(10),
        ..test_helpers::test_config()
    });
    let alice = join_user(&state, "alice", "r1").await;
    let alice_id = drop_transport(&state, alice).await;

    let sweeper = spawn_sweeper(state.clone());
    tokio::time::sleep(Duration::from_millis(300)).await;
    sweeper.abort();

    assert!(lifecycle(&state, alice_id).await.is_none());
    assert!(crate::services::room::lookup(&state, "r1").await.is_none());
}

#[tokio::test]
async fn expired_member_and_leaver_empty_room_until_destroyed() {
    let state = test_helpers::test_app_state();
    let alice = join_user(&state, "alice", "r1").await;
    let bob = join_user(&state, "bob", "r1").await;
    submit_id(&state, bob.session_id, "a").await;
    let alice_id = drop_transport(&state, alice).await;

    let past_grace = Instant::now() + state.config.grace_window + Duration::from_millis(10);
    assert_eq!(reap_expired(&state, past_grace).await, vec![alice_id]);

    assert!(room::leave(&state, bob.session_id, "r1").await);
    mark_left(&state, bob.session_id).await;

    let past_room_grace = Instant::now() + state.config.room_grace + Duration::from_millis(10);
    assert_eq!(room::destroy_idle(&state, past_room_grace).await, vec!["r1".to_string()]);

    let mut carol = join_user(&state, "carol", "r2").await;
    let request = Frame::request(frame::ROOM_JOIN, Data::new());
    let joined = room::join(&state, carol.session_id, "r1", &request).await.unwrap();
    assert_eq!(joined.base_sequence, 0);
    let reply = recv_frame(&mut carol.inbox).await;
    assert_eq!(reply.data["snapshot"]["elements"], serde_json::json!([]));
}
