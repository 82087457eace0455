//! Transition table for the media negotiation (ROAP) machine.
//!
//! Negotiation rounds flow offer -> answer -> OK, with offer requests and
//! glare folded in. The `Ok` state is the resting point between rounds;
//! renegotiation re-enters the table from there.

use std::collections::HashMap;

use lazy_static::lazy_static;

use super::types::{MediaAction, MediaEventKind, MediaState, MediaTransition};

type Key = (MediaState, MediaEventKind);

fn entry(
    table: &mut HashMap<Key, MediaTransition>,
    state: MediaState,
    event: MediaEventKind,
    next: MediaState,
    action: MediaAction,
) {
    table.insert((state, event), MediaTransition { next, action });
}

fn build() -> HashMap<Key, MediaTransition> {
    use MediaAction as A;
    use MediaEventKind as E;
    use MediaState as S;

    let mut t = HashMap::new();

    entry(
        &mut t,
        S::Idle,
        E::RecvOfferRequest,
        S::RecvOfferRequest,
        A::IncomingOfferRequest,
    );
    entry(&mut t, S::Idle, E::RecvOffer, S::RecvOffer, A::IncomingOffer);
    entry(&mut t, S::Idle, E::SendOffer, S::SendOffer, A::OutgoingOffer);

    entry(
        &mut t,
        S::RecvOfferRequest,
        E::SendOffer,
        S::SendOffer,
        A::OutgoingOffer,
    );
    entry(&mut t, S::RecvOfferRequest, E::Ok, S::Ok, A::RoapOk);
    entry(&mut t, S::RecvOfferRequest, E::Error, S::Error, A::RoapError);

    entry(
        &mut t,
        S::RecvOffer,
        E::SendAnswer,
        S::SendAnswer,
        A::OutgoingAnswer,
    );
    entry(&mut t, S::RecvOffer, E::Ok, S::Ok, A::RoapOk);
    entry(&mut t, S::RecvOffer, E::Error, S::Error, A::RoapError);

    entry(
        &mut t,
        S::SendOffer,
        E::RecvAnswer,
        S::RecvAnswer,
        A::IncomingAnswer,
    );
    // Glare: the remote answered our offer with an offer of its own and
    // the engine produced an answer for it.
    entry(
        &mut t,
        S::SendOffer,
        E::SendAnswer,
        S::SendAnswer,
        A::OutgoingAnswer,
    );
    entry(&mut t, S::SendOffer, E::SendOffer, S::SendOffer, A::OutgoingOffer);
    entry(&mut t, S::SendOffer, E::Error, S::Error, A::RoapError);

    entry(&mut t, S::RecvAnswer, E::Ok, S::Ok, A::RoapOk);
    entry(&mut t, S::RecvAnswer, E::Error, S::Error, A::RoapError);

    entry(
        &mut t,
        S::SendAnswer,
        E::RecvOfferRequest,
        S::RecvOfferRequest,
        A::IncomingOfferRequest,
    );
    entry(
        &mut t,
        S::SendAnswer,
        E::RecvOffer,
        S::RecvOffer,
        A::IncomingOffer,
    );
    entry(&mut t, S::SendAnswer, E::Ok, S::Ok, A::RoapOk);
    entry(
        &mut t,
        S::SendAnswer,
        E::SendAnswer,
        S::SendAnswer,
        A::OutgoingAnswer,
    );
    entry(&mut t, S::SendAnswer, E::Error, S::Error, A::RoapError);

    entry(
        &mut t,
        S::Ok,
        E::RecvOfferRequest,
        S::RecvOfferRequest,
        A::IncomingOfferRequest,
    );
    entry(&mut t, S::Ok, E::RecvOffer, S::RecvOffer, A::IncomingOffer);
    entry(&mut t, S::Ok, E::SendOffer, S::SendOffer, A::OutgoingOffer);
    entry(&mut t, S::Ok, E::Ok, S::Ok, A::RoapOk);
    entry(&mut t, S::Ok, E::Error, S::Error, A::RoapError);
    entry(&mut t, S::Ok, E::Teardown, S::Teardown, A::None);

    // Recovery from a failed round.
    entry(
        &mut t,
        S::Error,
        E::RecvOfferRequest,
        S::RecvOfferRequest,
        A::IncomingOfferRequest,
    );
    entry(&mut t, S::Error, E::RecvOffer, S::RecvOffer, A::IncomingOffer);
    entry(
        &mut t,
        S::Error,
        E::RecvAnswer,
        S::RecvAnswer,
        A::IncomingAnswer,
    );
    entry(&mut t, S::Error, E::Ok, S::Ok, A::RoapOk);
    entry(&mut t, S::Error, E::Teardown, S::Teardown, A::None);

    t
}

lazy_static! {
    static ref MEDIA_TABLE: HashMap<Key, MediaTransition> = build();
}

/// Look up the transition for an event in a state, if the state accepts it.
pub fn lookup(state: MediaState, event: MediaEventKind) -> Option<MediaTransition> {
    MEDIA_TABLE.get(&(state, event)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_is_a_dead_end() {
        for event in [
            MediaEventKind::RecvOffer,
            MediaEventKind::SendOffer,
            MediaEventKind::Ok,
            MediaEventKind::Teardown,
        ] {
            assert!(lookup(MediaState::Teardown, event).is_none());
        }
    }

    #[test]
    fn outbound_negotiation_round() {
        let mut state = MediaState::Idle;
        for event in [
            MediaEventKind::SendOffer,
            MediaEventKind::RecvAnswer,
            MediaEventKind::Ok,
        ] {
            state = lookup(state, event).expect("transition").next;
        }
        assert_eq!(state, MediaState::Ok);
    }

    #[test]
    fn inbound_negotiation_round() {
        let mut state = MediaState::Idle;
        for event in [
            MediaEventKind::RecvOffer,
            MediaEventKind::SendAnswer,
            MediaEventKind::Ok,
        ] {
            state = lookup(state, event).expect("transition").next;
        }
        assert_eq!(state, MediaState::Ok);
    }

    #[test]
    fn renegotiation_restarts_from_ok() {
        assert!(lookup(MediaState::Ok, MediaEventKind::RecvOfferRequest).is_some());
        assert!(lookup(MediaState::Ok, MediaEventKind::RecvOffer).is_some());
        assert!(lookup(MediaState::Ok, MediaEventKind::SendOffer).is_some());
    }

    #[test]
    fn error_state_allows_recovery_but_not_local_offers() {
        assert!(lookup(MediaState::Error, MediaEventKind::RecvOffer).is_some());
        assert!(lookup(MediaState::Error, MediaEventKind::Ok).is_some());
        assert!(lookup(MediaState::Error, MediaEventKind::SendOffer).is_none());
    }

    #[test]
    fn teardown_only_reachable_from_resting_states() {
        assert!(lookup(MediaState::Ok, MediaEventKind::Teardown).is_some());
        assert!(lookup(MediaState::Error, MediaEventKind::Teardown).is_some());
        assert!(lookup(MediaState::RecvOffer, MediaEventKind::Teardown).is_none());
    }
}
