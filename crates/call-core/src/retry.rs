//! Classification of signaling failures into retry or surface decisions.
//!
//! A 403 or 503 that carries a `Retry-After` header is transient: the
//! request is resent once after the indicated delay, but only while the
//! call is connected. Everything else is surfaced to the application as an
//! error event with a user-presentable message.

use std::time::Duration;

use crate::error::{FailureKind, TransportError};

/// What to do about a failed signaling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Resend the same request once after the server-indicated delay.
    Retry { after: Duration },
    /// Report the failure to the application.
    Surface { kind: FailureKind, message: String },
}

/// Classify a transport failure, honoring `Retry-After` on 403/503.
pub fn classify(error: &TransportError) -> FailureAction {
    match error {
        TransportError::Status {
            status,
            retry_after,
            error_code,
        } => match status {
            401 => FailureAction::Surface {
                kind: FailureKind::Unauthorized,
                message: "User is unauthorized due to an expired token. Sign out, then sign back in."
                    .to_string(),
            },
            403 => match retry_after {
                Some(seconds) => FailureAction::Retry {
                    after: Duration::from_secs(*seconds),
                },
                None => FailureAction::Surface {
                    kind: FailureKind::Forbidden,
                    message: body_message(*error_code).to_string(),
                },
            },
            404 => FailureAction::Surface {
                kind: FailureKind::NotFound,
                message: "The call is no longer active on the server.".to_string(),
            },
            409 => FailureAction::Surface {
                kind: FailureKind::Conflict,
                message: "The request conflicts with the current state of the call.".to_string(),
            },
            503 => match retry_after {
                Some(seconds) => FailureAction::Retry {
                    after: Duration::from_secs(*seconds),
                },
                None => FailureAction::Surface {
                    kind: FailureKind::ServiceUnavailable,
                    message: "The server is temporarily unavailable. Wait and try again."
                        .to_string(),
                },
            },
            500..=599 => FailureAction::Surface {
                kind: FailureKind::ServerError,
                message: "An unexpected error occurred on the server.".to_string(),
            },
            _ => FailureAction::Surface {
                kind: FailureKind::Unknown,
                message: "An unknown error occurred while placing the request.".to_string(),
            },
        },
        TransportError::Timeout => FailureAction::Surface {
            kind: FailureKind::Timeout,
            message: "The request to the calling service timed out.".to_string(),
        },
        TransportError::Connection(message) => FailureAction::Surface {
            kind: FailureKind::Unknown,
            message: message.clone(),
        },
    }
}

/// Classify with the retry option folded away, for contexts where no retry
/// is scheduled (pre-connect signaling, transfers, teardown).
pub fn surface(error: &TransportError) -> (FailureKind, String) {
    match classify(error) {
        FailureAction::Retry { .. } => (
            FailureKind::ServiceUnavailable,
            "The server is temporarily unavailable. Wait and try again.".to_string(),
        ),
        FailureAction::Surface { kind, message } => (kind, message),
    }
}

/// User-presentable message for a service error code from a 403 body.
fn body_message(error_code: Option<u32>) -> &'static str {
    match error_code {
        Some(111) => "An invalid status update was received for the call.",
        Some(112) => "The device is not registered with the calling service.",
        Some(113) => "The call could not be found on the server.",
        Some(114) => "An error occurred while processing the call on the server.",
        Some(115) => "The user is busy.",
        Some(116) => "The server could not parse the request.",
        Some(118) => "The request was not acceptable to the server.",
        Some(119) => "The call was rejected by the server.",
        Some(120) => "The user is not available.",
        _ => "An unknown error occurred while placing the request.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, retry_after: Option<u64>, error_code: Option<u32>) -> TransportError {
        TransportError::Status {
            status,
            retry_after,
            error_code,
        }
    }

    #[test]
    fn retry_after_on_503_schedules_a_retry() {
        let action = classify(&status(503, Some(30), None));
        assert_eq!(
            action,
            FailureAction::Retry {
                after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn retry_after_on_403_schedules_a_retry() {
        let action = classify(&status(403, Some(5), Some(114)));
        assert_eq!(
            action,
            FailureAction::Retry {
                after: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn forbidden_without_retry_after_maps_body_code() {
        match classify(&status(403, None, Some(115))) {
            FailureAction::Surface { kind, message } => {
                assert_eq!(kind, FailureKind::Forbidden);
                assert_eq!(message, "The user is busy.");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn unauthorized_is_never_retried() {
        match classify(&status(401, Some(10), None)) {
            FailureAction::Surface { kind, .. } => assert_eq!(kind, FailureKind::Unauthorized),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn server_errors_surface_as_server_error() {
        match classify(&status(500, None, None)) {
            FailureAction::Surface { kind, .. } => assert_eq!(kind, FailureKind::ServerError),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn timeout_surfaces_as_timeout() {
        match classify(&TransportError::Timeout) {
            FailureAction::Surface { kind, .. } => assert_eq!(kind, FailureKind::Timeout),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn surface_folds_retry_into_service_unavailable() {
        let (kind, _) = surface(&status(503, Some(30), None));
        assert_eq!(kind, FailureKind::ServiceUnavailable);
    }

    #[test]
    fn unknown_body_code_gets_generic_message() {
        match classify(&status(403, None, Some(42))) {
            FailureAction::Surface { message, .. } => {
                assert!(message.contains("unknown error"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
