//! Transition table for the call-control machine.
//!
//! Entries mirror the signaling lifecycle: setup in either direction,
//! progress, connect, established, hold/resume excursions, and the two
//! disconnect paths. Disconnects and the error sink are accepted from
//! every live state.

use std::collections::HashMap;

use lazy_static::lazy_static;

use super::types::{CallAction, CallEventKind, CallState, CallTransition};

type Key = (CallState, CallEventKind);

fn entry(
    table: &mut HashMap<Key, CallTransition>,
    state: CallState,
    event: CallEventKind,
    next: CallState,
    action: CallAction,
) {
    table.insert((state, event), CallTransition { next, action });
}

/// Add the transitions every live state accepts: both disconnect
/// directions and the error sink.
fn common_exits(table: &mut HashMap<Key, CallTransition>, state: CallState) {
    entry(
        table,
        state,
        CallEventKind::RecvDisconnect,
        CallState::RecvDisconnect,
        CallAction::IncomingDisconnect,
    );
    entry(
        table,
        state,
        CallEventKind::SendDisconnect,
        CallState::SendDisconnect,
        CallAction::OutgoingDisconnect,
    );
    entry(
        table,
        state,
        CallEventKind::Unknown,
        CallState::Unknown,
        CallAction::Unknown,
    );
}

fn build() -> HashMap<Key, CallTransition> {
    use CallAction as A;
    use CallEventKind as E;
    use CallState as S;

    let mut t = HashMap::new();

    entry(&mut t, S::Idle, E::RecvSetup, S::RecvSetup, A::IncomingSetup);
    entry(&mut t, S::Idle, E::SendSetup, S::SendSetup, A::OutgoingSetup);
    common_exits(&mut t, S::Idle);

    entry(
        &mut t,
        S::RecvSetup,
        E::SendAlerting,
        S::SendProgress,
        A::OutgoingAlerting,
    );
    common_exits(&mut t, S::RecvSetup);

    entry(
        &mut t,
        S::SendSetup,
        E::RecvProgress,
        S::RecvProgress,
        A::IncomingProgress,
    );
    entry(
        &mut t,
        S::SendSetup,
        E::RecvConnect,
        S::RecvConnect,
        A::IncomingConnect,
    );
    common_exits(&mut t, S::SendSetup);

    // Progress may repeat (e.g. ringback following early media).
    entry(
        &mut t,
        S::RecvProgress,
        E::RecvProgress,
        S::RecvProgress,
        A::IncomingProgress,
    );
    entry(
        &mut t,
        S::RecvProgress,
        E::RecvConnect,
        S::RecvConnect,
        A::IncomingConnect,
    );
    common_exits(&mut t, S::RecvProgress);

    entry(
        &mut t,
        S::SendProgress,
        E::SendConnect,
        S::SendConnect,
        A::OutgoingConnect,
    );
    common_exits(&mut t, S::SendProgress);

    entry(
        &mut t,
        S::RecvConnect,
        E::Established,
        S::Established,
        A::Established,
    );
    common_exits(&mut t, S::RecvConnect);

    entry(
        &mut t,
        S::SendConnect,
        E::Established,
        S::Established,
        A::Established,
    );
    common_exits(&mut t, S::SendConnect);

    entry(
        &mut t,
        S::Established,
        E::Hold,
        S::Hold,
        A::InitiateHold,
    );
    entry(
        &mut t,
        S::Established,
        E::Resume,
        S::Resume,
        A::InitiateResume,
    );
    // Re-established after a completed or failed hold/resume round.
    entry(
        &mut t,
        S::Established,
        E::Established,
        S::Established,
        A::Established,
    );
    common_exits(&mut t, S::Established);

    entry(&mut t, S::Hold, E::Established, S::Established, A::Established);
    common_exits(&mut t, S::Hold);

    entry(
        &mut t,
        S::Resume,
        E::Established,
        S::Established,
        A::Established,
    );
    common_exits(&mut t, S::Resume);

    entry(&mut t, S::RecvDisconnect, E::Cleared, S::Cleared, A::None);
    entry(&mut t, S::SendDisconnect, E::Cleared, S::Cleared, A::None);
    entry(&mut t, S::Unknown, E::Cleared, S::Cleared, A::None);

    t
}

lazy_static! {
    static ref CALL_TABLE: HashMap<Key, CallTransition> = build();
}

/// Look up the transition for an event in a state, if the state accepts it.
pub fn lookup(state: CallState, event: CallEventKind) -> Option<CallTransition> {
    CALL_TABLE.get(&(state, event)).copied()
}
