//! Wire-level error codes
//!
//! Every layer keeps its own `thiserror` enum; this is the stable code each
//! of them maps to when an error crosses the gateway as an `error{code, message}`
//! event or a request/response failure.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// DNS / refused / handshake timeout, or a host still in its backoff window
    TransportFailure,
    /// Credentials rejected by the remote host
    AuthFailure,
    /// A command or channel did not answer in time
    SessionTimeout,
    /// Pool or session limit reached
    Capacity,
    SessionNotFound,
    HostNotFound,
    /// Malformed or unknown client message
    BadRequest,
    /// Message refers to a resource owned by another client
    Forbidden,
    /// Gateway connection did not authenticate
    Unauthenticated,
    ContainerFailure,
    Internal,
}

impl ErrorCode {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::TransportFailure | ErrorCode::Capacity | ErrorCode::SessionTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TransportFailure => "transport_failure",
            ErrorCode::AuthFailure => "auth_failure",
            ErrorCode::SessionTimeout => "session_timeout",
            ErrorCode::Capacity => "capacity",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::HostNotFound => "host_not_found",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::ContainerFailure => "container_failure",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
