//! Connection authenticator — classify a connection request once per connect.
//!
//! DESIGN
//! ======
//! A connection request is an explicit two-variant choice: a presented bearer
//! credential or anonymous access. The authenticator turns it into an
//! `Identity` or an `AuthRejection`; rejection is never folded into anonymous.
//!
//! Tokens are issued outside the broker and have the shape
//! `v1.<subject>.<expires_unix_secs>.<hex hmac-sha256>`, where the MAC covers
//! everything before the final dot.

use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";
const MAX_SUBJECT_LEN: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

/// What the client presented at connection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRequest {
    Authenticated(String),
    Anonymous,
}

impl ConnectRequest {
    /// Build a request from the `Authorization` header value and `token` query
    /// parameter. The header wins when both are present.
    ///
    /// # Errors
    ///
    /// Returns [`AuthRejection::Malformed`] when the header is present but does
    /// not use the `Bearer` scheme or carries an empty credential.
    pub fn from_parts(authorization: Option<&str>, query_token: Option<&str>) -> Result<Self, AuthRejection> {
        if let Some(header) = authorization {
            let Some((scheme, credential)) = header.trim().split_once(' ') else {
                return Err(AuthRejection::Malformed);
            };
            let credential = credential.trim();
            if !scheme.eq_ignore_ascii_case("bearer") || credential.is_empty() {
                return Err(AuthRejection::Malformed);
            }
            return Ok(Self::Authenticated(credential.to_owned()));
        }

        match query_token.map(str::trim) {
            Some("") | None => Ok(Self::Anonymous),
            Some(token) => Ok(Self::Authenticated(token.to_owned())),
        }
    }

    /// Like [`ConnectRequest::from_parts`], but takes the raw header bytes.
    /// A header that is present but not visible ASCII is malformed, never
    /// treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`AuthRejection::Malformed`] for undecodable or non-bearer headers.
    pub fn from_raw_parts(authorization: Option<&[u8]>, query_token: Option<&str>) -> Result<Self, AuthRejection> {
        let authorization = match authorization {
            Some(raw) if !raw.iter().all(|b| b.is_ascii_graphic() || *b == b' ' || *b == b'\t') => {
                return Err(AuthRejection::Malformed);
            }
            Some(raw) => Some(std::str::from_utf8(raw).map_err(|_| AuthRejection::Malformed)?),
            None => None,
        };
        Self::from_parts(authorization, query_token)
    }
}

/// Who a session is. Anonymous identities are unique per connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Identity {
    User { subject: String },
    Anonymous { id: Uuid },
}

impl Identity {
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous { .. })
    }

    /// Display label stamped as `from` on frames originated by this identity.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::User { subject } => subject.clone(),
            Self::Anonymous { id } => format!("anon-{}", &id.simple().to_string()[..8]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("malformed credential")]
    Malformed,
    #[error("credential signature mismatch")]
    BadSignature,
    #[error("credential expired")]
    Expired,
    #[error("anonymous access is disabled")]
    AnonymousNotAllowed,
}

// =============================================================================
// AUTHENTICATOR
// =============================================================================

pub struct Authenticator {
    secret: Vec<u8>,
    allow_anonymous: bool,
}

impl Authenticator {
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>, allow_anonymous: bool) -> Self {
        Self { secret: secret.into(), allow_anonymous }
    }

    /// Classify a connection request against the current wall clock.
    pub fn authenticate(&self, request: &ConnectRequest) -> Result<Identity, AuthRejection> {
        self.authenticate_at(request, unix_now())
    }

    /// Classify a connection request at an explicit unix time (seconds).
    pub fn authenticate_at(&self, request: &ConnectRequest, now_secs: u64) -> Result<Identity, AuthRejection> {
        match request {
            ConnectRequest::Anonymous if self.allow_anonymous => Ok(Identity::Anonymous { id: Uuid::new_v4() }),
            ConnectRequest::Anonymous => Err(AuthRejection::AnonymousNotAllowed),
            ConnectRequest::Authenticated(token) => self.verify(token, now_secs),
        }
    }

    fn verify(&self, token: &str, now_secs: u64) -> Result<Identity, AuthRejection> {
        let (signed, signature) = token.rsplit_once('.').ok_or(AuthRejection::Malformed)?;
        let mut parts = signed.split('.');
        let (Some(version), Some(subject), Some(expires), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthRejection::Malformed);
        };
        if version != TOKEN_VERSION || !valid_subject(subject) {
            return Err(AuthRejection::Malformed);
        }
        let expires: u64 = expires.parse().map_err(|_| AuthRejection::Malformed)?;
        let signature = hex_to_bytes(signature).ok_or(AuthRejection::Malformed)?;

        let mut mac = self.mac();
        mac.update(signed.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthRejection::BadSignature)?;

        if expires <= now_secs {
            return Err(AuthRejection::Expired);
        }
        Ok(Identity::User { subject: subject.to_owned() })
    }

    /// Issue a token for `subject` expiring at `expires_secs` (unix seconds).
    ///
    /// # Errors
    ///
    /// Returns [`AuthRejection::Malformed`] if the subject contains characters
    /// outside `[A-Za-z0-9_-]` or is too long.
    pub fn issue_token(&self, subject: &str, expires_secs: u64) -> Result<String, AuthRejection> {
        if !valid_subject(subject) {
            return Err(AuthRejection::Malformed);
        }
        let signed = format!("{TOKEN_VERSION}.{subject}.{expires_secs}");
        let mut mac = self.mac();
        mac.update(signed.as_bytes());
        let signature = bytes_to_hex(&mac.finalize().into_bytes());
        Ok(format!("{signed}.{signature}"))
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.secret).unwrap_or_else(|_| unreachable!("hmac key length is unrestricted"))
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Generate a random 32-byte hex secret for processes started without one.
#[must_use]
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

fn valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject.len() <= MAX_SUBJECT_LEN
        && subject
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

pub(crate) fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.is_empty() || hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
