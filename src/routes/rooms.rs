//! Read-only room status for operators.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::services::room::{self, MemberInfo, RoomStatus};
use crate::state::AppState;

/// `GET /api/rooms/{id}` — counters for a live room, 404 otherwise.
pub async fn room_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<RoomStatus>, StatusCode> {
    room::status(&state, &id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// `GET /api/rooms/{id}/members` — point-in-time membership, 404 for unknown rooms.
pub async fn room_members(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MemberInfo>>, StatusCode> {
    if room::lookup(&state, &id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(room::members(&state, &id).await))
}
