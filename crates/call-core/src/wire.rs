//! Wire-format payloads exchanged with the calling service.
//!
//! Everything here is a plain serde mirror of the JSON the server speaks:
//! push notifications coming down the websocket on one side, and the
//! request bodies the [`SignalingTransport`](crate::traits::SignalingTransport)
//! posts on the other. Field names follow the server's camelCase convention.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CallId, CallRtpStats, CallTarget, CorrelationId, TransferType};

// ---------------------------------------------------------------------------
// ROAP
// ---------------------------------------------------------------------------

/// ROAP message kinds carried in media bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoapMessageType {
    Offer,
    Answer,
    Ok,
    Error,
    OfferRequest,
    OfferResponse,
}

/// A single ROAP negotiation message.
///
/// `seq` numbering is owned by the [`Sequencer`](crate::sequencer::Sequencer);
/// handlers restamp it before a message leaves the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoapMessage {
    pub seq: u32,
    pub message_type: RoapMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RoapMessage {
    pub fn new(message_type: RoapMessageType, seq: u32) -> Self {
        Self {
            seq,
            message_type,
            sdp: None,
            error_type: None,
            version: None,
        }
    }

    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.sdp = Some(sdp.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Push notifications
// ---------------------------------------------------------------------------

/// Kind of server push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushEventType {
    #[serde(rename = "call.setup")]
    Setup,
    #[serde(rename = "call.progress")]
    Progress,
    #[serde(rename = "call.connected")]
    Connected,
    #[serde(rename = "call.disconnected")]
    Disconnected,
    #[serde(rename = "call.media")]
    Media,
    #[serde(other)]
    Unknown,
}

/// Raw caller identity fields from signaling, before directory resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(
        default,
        rename = "p-asserted-identity",
        skip_serializing_if = "Option::is_none"
    )]
    pub p_asserted_identity: Option<String>,
    #[serde(
        default,
        rename = "x-broadworks-remote-party-info",
        skip_serializing_if = "Option::is_none"
    )]
    pub x_broadworks_remote_party_info: Option<String>,
}

/// Ringing/early-media flags from a progress notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallProgressData {
    #[serde(default)]
    pub alerting: bool,
    #[serde(default)]
    pub inband_media: bool,
}

/// Mid-call state values reported while a call is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MidCallState {
    Held,
    Connected,
}

/// One entry of the `midCallService` list piggybacked on a setup push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "eventData")]
pub enum MidCallEntry {
    #[serde(rename = "callInfo")]
    CallInfo { #[serde(rename = "callerId")] caller_id: CallerIdInfo },
    #[serde(rename = "callState")]
    CallState { #[serde(rename = "callState")] call_state: MidCallState },
}

/// A push notification from the calling service, as dispatched to the
/// [`CallRegistry`](crate::registry::CallRegistry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    pub event_type: PushEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_progress_data: Option<CallProgressData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<CallerIdInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadworks_correlation_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid_call_service: Option<Vec<MidCallEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<RoapMessage>,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Identity block included in every request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub correlation_id: CorrelationId,
}

/// Local SDP wrapper posted alongside signaling requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMedia {
    pub roap: RoapMessage,
    pub media_id: Uuid,
}

impl LocalMedia {
    pub fn new(roap: RoapMessage) -> Self {
        Self {
            roap,
            media_id: Uuid::new_v4(),
        }
    }
}

/// Body of the call-creation request for an outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub device: DeviceInfo,
    pub callee: CallTarget,
    pub local_media: LocalMedia,
}

/// Response to a call-creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallResponse {
    pub call_id: CallId,
}

/// Signaling states patched onto an inbound call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalState {
    #[serde(rename = "sig_alerting")]
    Alerting,
    #[serde(rename = "sig_connected")]
    Connected,
}

/// Body of the call-state patch (alerting / connected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatePatch {
    pub device: DeviceInfo,
    pub call_id: CallId,
    pub call_state: SignalState,
    pub inband_media: bool,
}

/// Body of a media (ROAP) post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRequest {
    pub device: DeviceInfo,
    pub call_id: CallId,
    pub local_media: LocalMedia,
}

/// Context for completing a transfer, blind or consult.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferContext {
    pub transferor_call_id: CallId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_to_call_id: Option<CallId>,
}

/// Body of a supplementary-service post (hold / resume / transfer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplementaryRequest {
    pub device: DeviceInfo,
    pub call_id: CallId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_type: Option<TransferType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blind_transfer_context: Option<TransferContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consult_transfer_context: Option<TransferContext>,
}

impl SupplementaryRequest {
    pub fn hold_resume(device: DeviceInfo, call_id: CallId) -> Self {
        Self {
            device,
            call_id,
            transfer_type: None,
            blind_transfer_context: None,
            consult_transfer_context: None,
        }
    }

    pub fn blind_transfer(device: DeviceInfo, call_id: CallId, destination: String) -> Self {
        Self {
            device,
            call_id: call_id.clone(),
            transfer_type: Some(TransferType::Blind),
            blind_transfer_context: Some(TransferContext {
                transferor_call_id: call_id,
                destination: Some(destination),
                transfer_to_call_id: None,
            }),
            consult_transfer_context: None,
        }
    }

    pub fn consult_transfer(device: DeviceInfo, call_id: CallId, transfer_to: CallId) -> Self {
        Self {
            device,
            call_id: call_id.clone(),
            transfer_type: Some(TransferType::Consult),
            blind_transfer_context: None,
            consult_transfer_context: Some(TransferContext {
                transferor_call_id: call_id,
                destination: None,
                transfer_to_call_id: Some(transfer_to),
            }),
        }
    }
}

/// Body of the session-refresh status post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusRequest {
    pub device: DeviceInfo,
    pub call_id: CallId,
}

/// Body of the call-delete request, carrying final RTP stats and the
/// disconnect cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCallRequest {
    pub device: DeviceInfo,
    pub call_id: CallId,
    pub metrics: CallRtpStats,
    pub causecode: u32,
    pub cause: String,
}
