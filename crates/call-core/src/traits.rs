//! Seams between the call engine and its environment.
//!
//! The engine never talks HTTP or touches media devices itself. The host
//! application supplies a [`SignalingTransport`] for the calling service's
//! REST surface, a [`MediaEngine`] per call for SDP negotiation and audio,
//! and optionally a [`CallerIdResolver`] and [`MetricsReporter`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CallResult, TransportError};
use crate::events::RemoteMediaTrack;
use crate::types::{CallId, CallRtpStats, CallerIdentity, CorrelationId};
use crate::wire::{
    CallStatePatch, CallStatusRequest, CallerIdInfo, CreateCallRequest, CreateCallResponse,
    DeleteCallRequest, MediaRequest, RoapMessage, SupplementaryRequest,
};

/// REST surface of the calling service.
///
/// Implementations own authentication, base URLs and HTTP plumbing. On a
/// non-success status they must report [`TransportError::Status`] with the
/// `Retry-After` header and body error code preserved, since retry policy
/// keys off both.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// POST a new outbound call.
    async fn create_call(
        &self,
        request: &CreateCallRequest,
    ) -> Result<CreateCallResponse, TransportError>;

    /// PATCH the signaling state of an inbound call (alerting / connected).
    async fn update_call_state(&self, request: &CallStatePatch) -> Result<(), TransportError>;

    /// POST a ROAP message for an existing call.
    async fn post_media(&self, request: &MediaRequest) -> Result<(), TransportError>;

    /// POST a supplementary-service request (hold / resume / transfer).
    async fn post_supplementary(
        &self,
        request: &SupplementaryRequest,
    ) -> Result<(), TransportError>;

    /// POST a session-refresh status for an established call.
    async fn post_status(&self, request: &CallStatusRequest) -> Result<(), TransportError>;

    /// DELETE a call, reporting final RTP stats and the disconnect cause.
    async fn delete_call(&self, request: &DeleteCallRequest) -> Result<(), TransportError>;
}

/// Events produced by a [`MediaEngine`].
#[derive(Debug, Clone)]
pub enum MediaEngineEvent {
    /// The engine produced a ROAP message to be sent to the server.
    RoapMessageToSend(RoapMessage),
    /// A remote media track became available.
    RemoteTrackAdded(RemoteMediaTrack),
}

/// Per-call media negotiation engine (a WebRTC peer connection, typically).
///
/// One engine is attached per call at dial or answer time. The engine pushes
/// [`MediaEngineEvent`]s through the receiver handed out by [`take_events`];
/// the call task consumes them and feeds the media state machine.
///
/// [`take_events`]: MediaEngine::take_events
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Whether a usable local audio track is present. Calls without one are
    /// abandoned instead of dialed or answered.
    fn has_local_track(&self) -> bool;

    /// Hand over the engine's event stream. Returns `None` if already taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEngineEvent>>;

    /// Start negotiation by generating a local offer.
    async fn initiate_offer(&self) -> CallResult<()>;

    /// Apply a remote ROAP message (offer, answer, ok, offer request).
    async fn apply_remote_message(&self, message: &RoapMessage) -> CallResult<()>;

    async fn set_muted(&self, muted: bool) -> CallResult<()>;

    async fn insert_dtmf(&self, tone: &str) -> CallResult<()>;

    /// Final RTP counters, gathered during teardown.
    async fn rtp_stats(&self) -> CallRtpStats;

    /// Release media resources. Must be idempotent.
    async fn close(&self);
}

/// Resolves raw signaling caller-id fields into a directory identity.
#[async_trait]
pub trait CallerIdResolver: Send + Sync {
    /// Return a refined identity, or `None` when nothing better than the
    /// raw signaling fields is known.
    async fn resolve(&self, raw: &CallerIdInfo) -> Option<CallerIdentity>;
}

/// Resolver that never refines anything.
pub struct NoopCallerIdResolver;

#[async_trait]
impl CallerIdResolver for NoopCallerIdResolver {
    async fn resolve(&self, _raw: &CallerIdInfo) -> Option<CallerIdentity> {
        None
    }
}

/// Category of a reported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    CallState,
    MediaState,
    CallError,
    MediaError,
    Supplementary,
}

/// One metric sample tied to a call.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub kind: MetricKind,
    pub label: String,
    pub correlation_id: CorrelationId,
    pub call_id: CallId,
}

/// Sink for call quality and state metrics.
pub trait MetricsReporter: Send + Sync {
    fn record(&self, metric: MetricRecord);
}

/// Reporter that drops every sample.
pub struct NoopMetrics;

impl MetricsReporter for NoopMetrics {
    fn record(&self, _metric: MetricRecord) {}
}
