//! State, event and transition types for the two per-call machines.
//!
//! Every call runs a call-control machine (signaling lifecycle) and a media
//! negotiation machine (ROAP) side by side. Both are driven from the same
//! per-call task; the tables in this module define which events each state
//! accepts and which action handler runs on the transition. Events that do
//! not match a table entry are logged and dropped.

use std::fmt;

/// States of the call-control machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Freshly created, nothing has happened yet.
    Idle,
    /// Inbound setup received from the server.
    RecvSetup,
    /// Outbound setup sent to the server.
    SendSetup,
    /// Remote end is alerting (outbound leg).
    RecvProgress,
    /// We reported alerting for an inbound leg.
    SendProgress,
    /// Remote end answered (outbound leg).
    RecvConnect,
    /// We answered an inbound leg.
    SendConnect,
    /// Signaling and media are both up.
    Established,
    /// Hold requested, awaiting outcome.
    Hold,
    /// Resume requested, awaiting outcome.
    Resume,
    /// Remote or network disconnect received.
    RecvDisconnect,
    /// Local disconnect initiated.
    SendDisconnect,
    /// An unrecoverable signaling or media error occurred.
    Unknown,
    /// Terminal. The call task exits in this state.
    Cleared,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Cleared)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Events driving the call-control machine, by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventKind {
    RecvSetup,
    SendSetup,
    SendAlerting,
    RecvProgress,
    RecvConnect,
    SendConnect,
    Established,
    Hold,
    Resume,
    RecvDisconnect,
    SendDisconnect,
    Unknown,
    Cleared,
}

/// Action handler bound to a call-control transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    IncomingSetup,
    OutgoingSetup,
    OutgoingAlerting,
    IncomingProgress,
    IncomingConnect,
    OutgoingConnect,
    Established,
    InitiateHold,
    InitiateResume,
    IncomingDisconnect,
    OutgoingDisconnect,
    Unknown,
    None,
}

/// One entry of the call-control table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTransition {
    pub next: CallState,
    pub action: CallAction,
}

/// States of the media negotiation machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaState {
    Idle,
    RecvOfferRequest,
    RecvOffer,
    SendOffer,
    RecvAnswer,
    SendAnswer,
    /// A round completed with an OK in either direction.
    Ok,
    /// A ROAP error was sent or received.
    Error,
    /// Terminal. Entered during call teardown.
    Teardown,
}

impl fmt::Display for MediaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Events driving the media machine, by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaEventKind {
    RecvOfferRequest,
    RecvOffer,
    SendOffer,
    RecvAnswer,
    SendAnswer,
    Ok,
    Error,
    Teardown,
}

/// Action handler bound to a media transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    IncomingOfferRequest,
    IncomingOffer,
    OutgoingOffer,
    IncomingAnswer,
    OutgoingAnswer,
    RoapOk,
    RoapError,
    None,
}

/// One entry of the media table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTransition {
    pub next: MediaState,
    pub action: MediaAction,
}
