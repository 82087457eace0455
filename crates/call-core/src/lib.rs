//! # cloudline-call-core
//!
//! Client-side call control for the Cloudline calling service.
//!
//! This crate owns everything between the application's "place a call"
//! button and the wire: the per-call signaling state machine, the ROAP
//! media negotiation machine and its sequence bookkeeping, the registry
//! that routes server push notifications to the right call, hold/resume
//! and transfer coordination, and the retry policy for transient server
//! failures. It deliberately owns nothing else - HTTP, websockets and
//! the actual media stack are supplied by the host through the traits in
//! [`traits`].
//!
//! ## Architecture
//!
//! - [`registry::CallRegistry`] is the entry point. It admits calls
//!   (outbound on request, inbound from setup pushes), keeps them keyed by
//!   correlation id, and dispatches every [`wire::PushEnvelope`] to the
//!   owning call.
//! - Each [`call::Call`] runs as its own tokio task. The task interprets
//!   two transition tables from [`state_table`] - one for the signaling
//!   lifecycle, one for ROAP negotiation - and owns the
//!   [`sequencer::Sequencer`] that numbers negotiation rounds.
//! - [`supplementary`] layers hold, resume and transfer on top of an
//!   established call, including the confirmation timers for the mid-call
//!   notifications that complete a hold or resume.
//! - [`retry`] classifies transport failures: 403/503 responses carrying
//!   `Retry-After` are resent once on connected calls, everything else is
//!   surfaced as an error event.
//!
//! Applications observe calls through broadcast channels: per-call
//! [`events::CallEvent`]s and registry-level [`events::RegistryEvent`]s.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod retry;
pub mod sequencer;
pub mod state_table;
pub mod supplementary;
pub mod traits;
pub mod types;
pub mod wire;

pub use call::{Call, ProgressInfo};
pub use config::EngineConfig;
pub use error::{CallError, CallResult, FailureKind, TransportError};
pub use events::{CallErrorInfo, CallEvent, IncomingCallInfo, RegistryEvent, RemoteMediaTrack};
pub use registry::CallRegistry;
pub use traits::{
    CallerIdResolver, MediaEngine, MediaEngineEvent, MetricKind, MetricRecord, MetricsReporter,
    NoopCallerIdResolver, NoopMetrics, SignalingTransport,
};
pub use types::{
    CallDirection, CallId, CallRtpStats, CallTarget, CallerIdentity, CorrelationId,
    DisconnectReason, SupplementaryService, TransferType,
};
pub use wire::{CallerIdInfo, PushEnvelope, PushEventType, RoapMessage, RoapMessageType};
