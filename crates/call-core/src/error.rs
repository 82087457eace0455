//! Error types for transport failures and call-level faults.

use thiserror::Error;

/// Failure of a single signaling request, as reported by the
/// [`SignalingTransport`](crate::traits::SignalingTransport) implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server answered with a non-success HTTP status.
    #[error("server returned status {status}")]
    Status {
        status: u16,
        /// Seconds from a `Retry-After` header, when present on 403/503.
        retry_after: Option<u64>,
        /// Service-specific error code from the response body, when present.
        error_code: Option<u32>,
    },
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The request never reached the server.
    #[error("transport failure: {0}")]
    Connection(String),
}

/// Broad classification of a surfaced failure, attached to error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ServerError,
    ServiceUnavailable,
    Timeout,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::Forbidden => "forbidden",
            FailureKind::NotFound => "not-found",
            FailureKind::Conflict => "conflict",
            FailureKind::ServerError => "server-error",
            FailureKind::ServiceUnavailable => "service-unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Faults raised by call operations and media-engine calls.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("media engine failure: {0}")]
    Media(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type CallResult<T> = Result<T, CallError>;
