//! Broker error taxonomy.
//!
//! ERROR HANDLING
//! ==============
//! Every error a session can observe maps to one grepable code. Only
//! `SequenceConflict` has room-wide consequences (a resync broadcast); all
//! other variants are reported to the offending session alone.

use crate::frame::ErrorCode;
use crate::services::auth::AuthRejection;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("authentication rejected: {0}")]
    AuthRejected(#[from] AuthRejection),
    #[error("room not found or not joined: {0}")]
    RoomNotFound(String),
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("sequence conflict in room {room_id}: expected {expected}, got {got}")]
    SequenceConflict { room_id: String, expected: u64, got: u64 },
    #[error("delivery backlog exceeded")]
    BackpressureExceeded,
    #[error("transport lost")]
    TransportLost,
    #[error("{0}")]
    RateLimited(#[from] crate::rate_limit::RateLimitError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ErrorCode for BrokerError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AuthRejected(_) => "E_AUTH_REJECTED",
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::InvalidRoomId(_) => "E_INVALID_ROOM_ID",
            Self::SequenceConflict { .. } => "E_SEQUENCE_CONFLICT",
            Self::BackpressureExceeded => "E_BACKPRESSURE",
            Self::TransportLost => "E_TRANSPORT_LOST",
            Self::RateLimited(_) => "E_RATE_LIMITED",
            Self::BadRequest(_) => "E_BAD_REQUEST",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::SequenceConflict { .. } | Self::TransportLost | Self::RateLimited(_))
    }
}

/// Why the server ended a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Backpressure,
}

impl DisconnectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backpressure => "backpressure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitError;

    #[test]
    fn codes_are_distinct_per_variant() {
        let errors = [
            BrokerError::AuthRejected(AuthRejection::Expired),
            BrokerError::RoomNotFound("r1".into()),
            BrokerError::InvalidRoomId(String::new()),
            BrokerError::SequenceConflict { room_id: "r1".into(), expected: 2, got: 3 },
            BrokerError::BackpressureExceeded,
            BrokerError::TransportLost,
            BrokerError::RateLimited(RateLimitError::EventRateExceeded { limit: 1, window_ms: 1 }),
            BrokerError::BadRequest("x".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(ErrorCode::error_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn auth_rejection_is_not_retryable() {
        assert!(!BrokerError::AuthRejected(AuthRejection::Malformed).retryable());
        assert!(BrokerError::TransportLost.retryable());
    }

    #[test]
    fn conflict_message_names_room_and_sequences() {
        let err = BrokerError::SequenceConflict { room_id: "r9".into(), expected: 4, got: 6 };
        assert_eq!(err.to_string(), "sequence conflict in room r9: expected 4, got 6");
    }
}
