//! Development token issuer.
//!
//! DESIGN
//! ======
//! Production deployments mint tokens elsewhere with the shared
//! `AUTH_SECRET`. For local work and load tests, `DEV_TOKEN_ISSUER=true`
//! exposes `POST /api/dev/token`, which signs a token for any valid subject.
//! When disabled the route answers 404 so it is indistinguishable from an
//! unknown path.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::info;

use crate::services::auth::unix_now;
use crate::state::AppState;

pub const DEFAULT_DEV_TOKEN_TTL_SECS: u64 = 3600;
pub const MAX_DEV_TOKEN_TTL_SECS: u64 = 86_400;

#[derive(Debug, Deserialize)]
pub struct DevTokenRequest {
    pub subject: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

pub async fn dev_token(
    State(state): State<AppState>,
    Json(body): Json<DevTokenRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !state.config.dev_token_issuer {
        return Err(StatusCode::NOT_FOUND);
    }

    let ttl = body
        .ttl_secs
        .unwrap_or(DEFAULT_DEV_TOKEN_TTL_SECS)
        .clamp(1, MAX_DEV_TOKEN_TTL_SECS);
    let expires_at = unix_now() + ttl;
    let token = state
        .auth
        .issue_token(&body.subject, expires_at)
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    info!(subject = %body.subject, ttl, "dev token issued");
    Ok(Json(serde_json::json!({ "token": token, "expires_at": expires_at })))
}
