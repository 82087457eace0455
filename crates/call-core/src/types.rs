//! Core identifier and value types shared across the call engine.
//!
//! A call is known by two names: the client-generated [`CorrelationId`],
//! which is stable for the lifetime of the call, and the server-assigned
//! [`CallId`], which only exists once the server has acknowledged the call.
//! Everything that outlives a single request keys off the correlation id.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-generated identifier for a call, stable from creation to teardown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Server-assigned identifier for a call leg.
///
/// Outbound calls carry a locally minted placeholder until the setup
/// response replaces it with the real server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Mint a local placeholder id used until the server assigns one.
    pub fn local(prefix: &str) -> Self {
        Self(format!("{}_{}", prefix, Uuid::new_v4()))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of the registered device this client represents.
pub type DeviceId = String;

/// Identifier of the line (subscriber address) a call belongs to.
pub type LineId = String;

/// Which side initiated the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Inbound => write!(f, "inbound"),
            CallDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Destination of an outbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    /// Address kind understood by the server ("uri", "tel", ...).
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
}

impl CallTarget {
    pub fn uri(address: impl Into<String>) -> Self {
        Self {
            kind: "uri".to_string(),
            address: address.into(),
        }
    }

    pub fn tel(address: impl Into<String>) -> Self {
        Self {
            kind: "tel".to_string(),
            address: address.into(),
        }
    }
}

/// Display identity of the remote party, as shown to the user.
///
/// Emitted twice per call when a directory resolver is configured: once
/// with the raw signaling fields and again once the resolver returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    pub name: Option<String>,
    pub number: Option<String>,
    pub avatar_url: Option<String>,
    pub user_id: Option<String>,
}

/// Supplementary service being requested on an established call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplementaryService {
    Hold,
    Resume,
    Transfer,
}

impl fmt::Display for SupplementaryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupplementaryService::Hold => write!(f, "hold"),
            SupplementaryService::Resume => write!(f, "resume"),
            SupplementaryService::Transfer => write!(f, "transfer"),
        }
    }
}

/// Flavor of call transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferType {
    Blind,
    Consult,
}

/// RTP quality counters reported to the server when a call is deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRtpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
}

/// Why a call ended, carried in the delete request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub code: u32,
    pub cause: &'static str,
}

impl DisconnectReason {
    pub const NORMAL: DisconnectReason = DisconnectReason {
        code: 0,
        cause: "Normal Disconnect.",
    };
    pub const BUSY: DisconnectReason = DisconnectReason {
        code: 115,
        cause: "User Busy.",
    };
    pub const MEDIA_INACTIVITY: DisconnectReason = DisconnectReason {
        code: 131,
        cause: "Media Inactivity.",
    };

    /// Pick the disconnect reason for a call that is being torn down.
    ///
    /// An inbound call ended before connecting counts as busy. A call
    /// abandoned because no usable local media was available counts as
    /// media inactivity. Everything else is a normal disconnect.
    pub fn derive(media_inactivity: bool, connected: bool, direction: CallDirection) -> Self {
        if media_inactivity {
            DisconnectReason::MEDIA_INACTIVITY
        } else if direction == CallDirection::Inbound && !connected {
            DisconnectReason::BUSY
        } else {
            DisconnectReason::NORMAL
        }
    }
}
