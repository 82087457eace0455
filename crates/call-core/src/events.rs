//! Events emitted to the application.
//!
//! Each call owns a broadcast channel of [`CallEvent`]; the registry owns a
//! separate channel of [`RegistryEvent`] for lifecycle notifications that are
//! not tied to a single call. Subscribers that fall behind lose the oldest
//! events, so consumers should treat the stream as advisory and read current
//! state from the call handle.

use chrono::{DateTime, Utc};

use crate::error::FailureKind;
use crate::types::{CallDirection, CallId, CallerIdentity, CorrelationId, DeviceId, LineId};

/// A remote media track surfaced by the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaTrack {
    pub id: String,
}

/// Details of a surfaced failure.
#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorInfo {
    pub kind: FailureKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CallErrorInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Events emitted on a single call's channel.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The remote end is being alerted (outbound) or ringback started.
    Progress { correlation_id: CorrelationId },
    /// The remote end answered; media negotiation may still be running.
    Connect { correlation_id: CorrelationId },
    /// Signaling and media are both up; the call is fully established.
    Established { correlation_id: CorrelationId },
    /// The server confirmed the call is on hold.
    Held { correlation_id: CorrelationId },
    /// The server confirmed the call resumed.
    Resumed { correlation_id: CorrelationId },
    /// The call ended from the remote side or the network.
    Disconnect { correlation_id: CorrelationId },
    /// Remote party identity, raw first and refined once resolved.
    CallerId {
        correlation_id: CorrelationId,
        caller: CallerIdentity,
    },
    /// The media engine produced a remote track.
    RemoteMedia {
        correlation_id: CorrelationId,
        track: RemoteMediaTrack,
    },
    /// A signaling or media failure that was not tied to hold/resume.
    CallError {
        correlation_id: CorrelationId,
        error: CallErrorInfo,
    },
    /// A hold request failed or was never confirmed.
    HoldError {
        correlation_id: CorrelationId,
        error: CallErrorInfo,
    },
    /// A resume request failed or was never confirmed.
    ResumeError {
        correlation_id: CorrelationId,
        error: CallErrorInfo,
    },
    /// A transfer request failed.
    TransferError {
        correlation_id: CorrelationId,
        error: CallErrorInfo,
    },
}

impl CallEvent {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            CallEvent::Progress { correlation_id }
            | CallEvent::Connect { correlation_id }
            | CallEvent::Established { correlation_id }
            | CallEvent::Held { correlation_id }
            | CallEvent::Resumed { correlation_id }
            | CallEvent::Disconnect { correlation_id }
            | CallEvent::CallerId { correlation_id, .. }
            | CallEvent::RemoteMedia { correlation_id, .. }
            | CallEvent::CallError { correlation_id, .. }
            | CallEvent::HoldError { correlation_id, .. }
            | CallEvent::ResumeError { correlation_id, .. }
            | CallEvent::TransferError { correlation_id, .. } => correlation_id,
        }
    }
}

/// Details of a newly arrived inbound call.
#[derive(Debug, Clone)]
pub struct IncomingCallInfo {
    pub correlation_id: CorrelationId,
    pub call_id: CallId,
    pub device_id: DeviceId,
    pub line_id: LineId,
    pub direction: CallDirection,
    pub broadworks_correlation_info: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Events emitted on the registry's channel.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new inbound call was admitted to the registry.
    IncomingCall(IncomingCallInfo),
    /// The last active call was removed from the registry.
    AllCallsCleared,
}
