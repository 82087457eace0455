//! ROAP sequencing across renegotiation rounds: ahead-of-round buffering
//! and offer-request seq restamping.

mod common;

use common::*;

use cloudline_call_core::config::EngineConfig;
use cloudline_call_core::registry::CallRegistry;
use cloudline_call_core::wire::{RoapMessage, RoapMessageType};

#[tokio::test]
async fn offer_a_round_ahead_is_held_until_the_ok() {
    let transport = MockTransport::new();
    let registry = CallRegistry::new(EngineConfig::default(), transport.clone());
    let (call, engine, _events) = establish_outbound(&registry, &transport).await;
    let correlation_id = call.correlation_id().clone();

    // Remote starts round two.
    registry.process_push(media_envelope(
        Some(&correlation_id),
        roap(RoapMessageType::Offer, 2),
    ));
    wait_for(|| engine.applied_count() >= 2, "round-two offer applied").await;
    engine.emit_roap(roap(RoapMessageType::Answer, 2));
    wait_for(|| transport.media_count() >= 2, "round-two answer posted").await;

    // The round-three offer overtakes the OK for round two; it must be
    // held back.
    registry.process_push(media_envelope(
        Some(&correlation_id),
        roap(RoapMessageType::Offer, 3),
    ));
    registry.process_push(media_envelope(
        Some(&correlation_id),
        RoapMessage::new(RoapMessageType::Ok, 2),
    ));

    wait_for(|| engine.applied_count() >= 4, "held offer replayed").await;
    let applied = engine.applied();
    // The OK lands before the replayed offer.
    assert_eq!(applied[2].message_type, RoapMessageType::Ok);
    let replayed = &applied[3];
    assert_eq!(replayed.message_type, RoapMessageType::Offer);
    assert_eq!(replayed.seq, 3);
}

#[tokio::test]
async fn offer_request_is_restamped_to_the_next_round() {
    let transport = MockTransport::new();
    let registry = CallRegistry::new(EngineConfig::default(), transport.clone());
    let (call, engine, _events) = establish_outbound(&registry, &transport).await;
    let media_before = transport.media_count();

    // Whatever seq the server uses, the request is applied with the next
    // local round number.
    registry.process_push(media_envelope(
        Some(call.correlation_id()),
        roap(RoapMessageType::OfferRequest, 4),
    ));
    wait_for(|| engine.applied_count() >= 2, "offer request applied").await;
    let applied = engine.applied();
    let request = &applied[1];
    assert_eq!(request.message_type, RoapMessageType::OfferRequest);
    assert_eq!(request.seq, 2);

    // The engine's response goes out as the offer for that round.
    engine.emit_roap(roap(RoapMessageType::OfferResponse, 2));
    wait_for(
        || transport.media_count() == media_before + 1,
        "offer response posted",
    )
    .await;
    let posted = transport
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            RecordedRequest::Media(request) => Some(request),
            _ => None,
        })
        .next_back()
        .expect("media request");
    assert_eq!(
        posted.local_media.roap.message_type,
        RoapMessageType::OfferResponse
    );
    assert_eq!(posted.local_media.roap.seq, 2);
}
