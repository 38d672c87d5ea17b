//! WebSocket handler — authenticated frame relay for one session.
//!
//! DESIGN
//! ======
//! The credential is checked before the upgrade; a rejected connection gets a
//! 401 with a structured error body and never becomes a session. After the
//! upgrade the task either opens a new session or resumes a disconnected one,
//! then enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall
//! - Frames from the session's delivery queue → forward to client
//!
//! Handlers return an `Outcome`. Anything that must stay ordered with room
//! traffic (joined replies, acks, sync replies) is queued by the service under
//! the room lock and arrives through the delivery queue; only errors and
//! room-independent replies are written directly.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `session:connected` or `session:resumed`
//! 2. Client frames → dispatch → Outcome
//! 3. `session:disconnected` from the queue → forward, close, done
//! 4. Socket loss → park the queue with the supervisor for the grace window

use std::collections::HashMap;
use std::time::Instant;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::frame::{self, Data, Frame, Status};
use crate::services::auth::{ConnectRequest, Identity};
use crate::services::sequencer::Submission;
use crate::services::supervisor::{self, Attached, Lifecycle};
use crate::services::{room, sequencer};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions.
#[derive(Debug)]
enum Outcome {
    /// The reply was queued on the session's delivery queue.
    Queued,
    /// Send done+data to sender only.
    Reply(Data),
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(HeaderValue::as_bytes);
    let identity = ConnectRequest::from_raw_parts(authorization, params.get("token").map(String::as_str))
        .and_then(|request| state.auth.authenticate(&request));

    let identity = match identity {
        Ok(identity) => identity,
        Err(rejection) => {
            let err = BrokerError::AuthRejected(rejection);
            warn!(from = ?Lifecycle::Connecting, to = ?Lifecycle::Terminated, error = %err, "ws: connection rejected");
            return (StatusCode::UNAUTHORIZED, Json(frame::error_data(&err))).into_response();
        }
    };

    let resume_id = params
        .get("resume")
        .and_then(|raw| Uuid::parse_str(raw).ok());
    ws.on_upgrade(move |socket| run_ws(socket, state, identity, resume_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

/// How the socket loop ended.
enum Exit {
    /// Socket closed or errored; the session waits out its grace window.
    /// Carries a dequeued frame that never reached the client.
    TransportLost(Option<Frame>),
    /// The server ended the session; the queue is gone or the notice was sent.
    Ended,
}

async fn attach(state: &AppState, identity: Identity, resume_id: Option<Uuid>) -> Attached {
    if let Some(session_id) = resume_id {
        match supervisor::resume(state, session_id, &identity, Instant::now()).await {
            Ok(attached) => return attached,
            Err(e) => info!(%session_id, reason = %e, "ws: resume refused; opening new session"),
        }
    }
    supervisor::open(state, identity).await
}

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity, resume_id: Option<Uuid>) {
    let label = identity.label();
    let anonymous = identity.is_anonymous();
    let Attached { session_id, mut inbox, connection, resumed, pending } = attach(&state, identity, resume_id).await;

    let welcome = if resumed {
        let room_id = supervisor::current_room(&state, session_id).await;
        let lifecycle = supervisor::lifecycle(&state, session_id).await;
        Frame::request(frame::SESSION_RESUMED, Data::new())
            .with_data("session_id", session_id.to_string())
            .with_data("room_id", serde_json::json!(room_id))
            .with_data("state", serde_json::json!(lifecycle))
    } else {
        Frame::request(frame::SESSION_CONNECTED, Data::new())
            .with_data("session_id", session_id.to_string())
            .with_data("identity", label.clone())
            .with_data("anonymous", anonymous)
    };

    info!(%session_id, identity = %label, resumed, "ws: client connected");

    let exit = if send_frame(&mut socket, &welcome).await.is_err() {
        Exit::TransportLost(pending)
    } else {
        relay(&mut socket, &state, session_id, &label, &mut inbox, pending).await
    };

    match exit {
        Exit::TransportLost(unsent) => {
            supervisor::detach(&state, session_id, connection, inbox, unsent, Instant::now()).await;
        }
        Exit::Ended => {
            let _ = socket.send(Message::Close(None)).await;
            info!(%session_id, "ws: session ended by server");
        }
    }
    info!(%session_id, "ws: client disconnected");
}

async fn relay(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: Uuid,
    label: &str,
    inbox: &mut tokio::sync::mpsc::Receiver<Frame>,
    pending: Option<Frame>,
) -> Exit {
    if let Some(frame) = pending {
        if let Some(exit) = forward(socket, frame).await {
            return exit;
        }
    }
    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { return Exit::TransportLost(None) };
                match msg {
                    Message::Text(text) => {
                        supervisor::touch(state, session_id, Instant::now()).await;
                        for frame in process_inbound_text(state, session_id, label, &text).await {
                            if send_frame(socket, &frame).await.is_err() {
                                return Exit::TransportLost(None);
                            }
                        }
                    }
                    Message::Close(_) => return Exit::TransportLost(None),
                    _ => {}
                }
            }
            queued = inbox.recv() => {
                let Some(frame) = queued else { return Exit::Ended };
                if let Some(exit) = forward(socket, frame).await {
                    return exit;
                }
            }
        }
    }
}

/// Send one frame from the delivery queue. Returns how the loop should end,
/// if it should.
async fn forward(socket: &mut WebSocket, frame: Frame) -> Option<Exit> {
    if send_frame(socket, &frame).await.is_err() {
        return Some(Exit::TransportLost(Some(frame)));
    }
    (frame.syscall == frame::SESSION_DISCONNECTED).then_some(Exit::Ended)
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Keeps websocket transport concerns separate from frame handling so tests
/// can drive dispatch without a socket.
async fn process_inbound_text(state: &AppState, session_id: Uuid, label: &str, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%session_id, error = %e, "ws: invalid inbound frame");
            let err = BrokerError::BadRequest(format!("invalid json: {e}"));
            return vec![Frame::request(frame::GATEWAY_ERROR, frame::error_data(&err))];
        }
    };

    // Stamp the authenticated identity as `from`.
    req.from = Some(label.to_owned());
    info!(%session_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = if req.status == Status::Request {
        match req.syscall.as_str() {
            frame::ROOM_JOIN => handle_join(state, session_id, &req).await,
            frame::ROOM_LEAVE => handle_leave(state, session_id, &req).await,
            frame::ROOM_SYNC => handle_sync(state, session_id, &req).await,
            frame::EVENT_SUBMIT => handle_submit(state, session_id, &req).await,
            other => Err(BrokerError::BadRequest(format!("unknown syscall: {other}"))),
        }
    } else {
        Err(BrokerError::BadRequest(format!("expected request status, got {:?}", req.status)))
    };

    match result {
        Ok(Outcome::Queued) => vec![],
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Err(e) => vec![req.error_from(&e)],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

fn requested_room(req: &Frame) -> Option<&str> {
    req.room_id
        .as_deref()
        .or_else(|| req.data_str("room_id"))
}

async fn handle_join(state: &AppState, session_id: Uuid, req: &Frame) -> Result<Outcome, BrokerError> {
    let Some(raw) = requested_room(req) else {
        return Err(BrokerError::BadRequest("room_id required".into()));
    };
    let room_id = room::validate_room_id(raw)?;
    room::join(state, session_id, &room_id, req).await?;
    Ok(Outcome::Queued)
}

async fn handle_leave(state: &AppState, session_id: Uuid, req: &Frame) -> Result<Outcome, BrokerError> {
    let current = supervisor::current_room(state, session_id).await;
    let room_id = match requested_room(req) {
        Some(raw) => room::validate_room_id(raw)?,
        None => current
            .clone()
            .ok_or_else(|| BrokerError::RoomNotFound("no room joined".into()))?,
    };
    if current.as_deref() != Some(room_id.as_str()) || !room::leave(state, session_id, &room_id).await {
        return Err(BrokerError::RoomNotFound(room_id));
    }
    supervisor::mark_left(state, session_id).await;

    let mut data = Data::new();
    data.insert("room_id".into(), serde_json::json!(room_id));
    Ok(Outcome::Reply(data))
}

async fn handle_sync(state: &AppState, session_id: Uuid, req: &Frame) -> Result<Outcome, BrokerError> {
    let Some(since) = req.data.get("since").and_then(serde_json::Value::as_u64) else {
        return Err(BrokerError::BadRequest("since required".into()));
    };
    let Some(room_id) = supervisor::current_room(state, session_id).await else {
        return Err(BrokerError::RoomNotFound("no room joined".into()));
    };
    room::sync(state, session_id, &room_id, since, req).await?;
    Ok(Outcome::Queued)
}

// =============================================================================
// EVENT HANDLER
// =============================================================================

async fn handle_submit(state: &AppState, session_id: Uuid, req: &Frame) -> Result<Outcome, BrokerError> {
    state.rate_limiter.check_and_record(session_id)?;

    let Some(payload) = req.data.get("payload").cloned() else {
        return Err(BrokerError::BadRequest("payload required".into()));
    };
    let submission = Submission {
        payload,
        idempotency_key: req
            .data_str("idempotency_key")
            .filter(|k| !k.is_empty())
            .map(str::to_owned),
        client_ts: req
            .data
            .get("client_ts")
            .and_then(serde_json::Value::as_i64),
    };
    sequencer::submit(state, session_id, req, submission).await?;
    Ok(Outcome::Queued)
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data_str(frame::FRAME_CODE).unwrap_or("-");
        let message = frame.data_str(frame::FRAME_MESSAGE).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if frame.syscall != frame::ROOM_EVENT {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
