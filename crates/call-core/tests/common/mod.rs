//! Shared fixtures for the integration tests: an in-memory signaling
//! transport, a scriptable media engine and push-envelope builders.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use cloudline_call_core::call::Call;
use cloudline_call_core::error::{CallResult, TransportError};
use cloudline_call_core::events::{CallEvent, RegistryEvent};
use cloudline_call_core::registry::CallRegistry;
use cloudline_call_core::traits::{MediaEngine, MediaEngineEvent, SignalingTransport};
use cloudline_call_core::types::{CallId, CallRtpStats, CallTarget, CorrelationId};
use cloudline_call_core::wire::{
    CallProgressData, CallStatePatch, CallStatusRequest, CallerIdInfo, CreateCallRequest,
    CreateCallResponse, DeleteCallRequest, MediaRequest, MidCallEntry, MidCallState, PushEnvelope,
    PushEventType, RoapMessage, RoapMessageType, SupplementaryRequest,
};

pub const DEVICE_ID: &str = "device-1";
pub const SERVER_CALL_ID: &str = "srv-call-1";

/// Install a subscriber once per test binary so `RUST_LOG` works when
/// chasing a failure.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RecordedRequest {
    Create(CreateCallRequest),
    StateUpdate(CallStatePatch),
    Media(MediaRequest),
    Supplementary(SupplementaryRequest),
    Status(CallStatusRequest),
    Delete(DeleteCallRequest),
}

/// Transport that records every request and answers from scripted result
/// queues, defaulting to success.
#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<RecordedRequest>>,
    create_results: Mutex<VecDeque<Result<CreateCallResponse, TransportError>>>,
    state_results: Mutex<VecDeque<Result<(), TransportError>>>,
    media_results: Mutex<VecDeque<Result<(), TransportError>>>,
    supplementary_results: Mutex<VecDeque<Result<(), TransportError>>>,
    supplementary_delays: Mutex<VecDeque<Duration>>,
    status_results: Mutex<VecDeque<Result<(), TransportError>>>,
    delete_results: Mutex<VecDeque<Result<(), TransportError>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn create_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Create(_)))
    }

    pub fn state_update_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::StateUpdate(_)))
    }

    pub fn media_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Media(_)))
    }

    pub fn supplementary_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Supplementary(_)))
    }

    pub fn status_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Status(_)))
    }

    pub fn delete_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Delete(_)))
    }

    fn count(&self, matches: impl Fn(&RecordedRequest) -> bool) -> usize {
        self.requests.lock().iter().filter(|r| matches(r)).count()
    }

    pub fn fail_next_create(&self, error: TransportError) {
        self.create_results.lock().push_back(Err(error));
    }

    pub fn fail_next_state_update(&self, error: TransportError) {
        self.state_results.lock().push_back(Err(error));
    }

    pub fn fail_next_media(&self, error: TransportError) {
        self.media_results.lock().push_back(Err(error));
    }

    pub fn fail_next_supplementary(&self, error: TransportError) {
        self.supplementary_results.lock().push_back(Err(error));
    }

    /// Hold the next supplementary response open for `delay` before
    /// resolving it, so a push can land while the request is in flight.
    pub fn delay_next_supplementary(&self, delay: Duration) {
        self.supplementary_delays.lock().push_back(delay);
    }

    pub fn fail_next_status(&self, error: TransportError) {
        self.status_results.lock().push_back(Err(error));
    }

    pub fn fail_next_delete(&self, error: TransportError) {
        self.delete_results.lock().push_back(Err(error));
    }

    fn next_unit(&self, queue: &Mutex<VecDeque<Result<(), TransportError>>>) -> Result<(), TransportError> {
        queue.lock().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn create_call(
        &self,
        request: &CreateCallRequest,
    ) -> Result<CreateCallResponse, TransportError> {
        self.requests
            .lock()
            .push(RecordedRequest::Create(request.clone()));
        self.create_results.lock().pop_front().unwrap_or_else(|| {
            Ok(CreateCallResponse {
                call_id: CallId::from(SERVER_CALL_ID),
            })
        })
    }

    async fn update_call_state(&self, request: &CallStatePatch) -> Result<(), TransportError> {
        self.requests
            .lock()
            .push(RecordedRequest::StateUpdate(request.clone()));
        self.next_unit(&self.state_results)
    }

    async fn post_media(&self, request: &MediaRequest) -> Result<(), TransportError> {
        self.requests
            .lock()
            .push(RecordedRequest::Media(request.clone()));
        self.next_unit(&self.media_results)
    }

    async fn post_supplementary(
        &self,
        request: &SupplementaryRequest,
    ) -> Result<(), TransportError> {
        self.requests
            .lock()
            .push(RecordedRequest::Supplementary(request.clone()));
        let delay = self.supplementary_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.next_unit(&self.supplementary_results)
    }

    async fn post_status(&self, request: &CallStatusRequest) -> Result<(), TransportError> {
        self.requests
            .lock()
            .push(RecordedRequest::Status(request.clone()));
        self.next_unit(&self.status_results)
    }

    async fn delete_call(&self, request: &DeleteCallRequest) -> Result<(), TransportError> {
        self.requests
            .lock()
            .push(RecordedRequest::Delete(request.clone()));
        self.next_unit(&self.delete_results)
    }
}

pub fn status_error(status: u16, retry_after: Option<u64>, error_code: Option<u32>) -> TransportError {
    TransportError::Status {
        status,
        retry_after,
        error_code,
    }
}

// ---------------------------------------------------------------------------
// Mock media engine
// ---------------------------------------------------------------------------

/// Media engine driven by the test: records what the call applies to it and
/// emits whatever ROAP messages the test scripts through [`emit`].
///
/// [`emit`]: MockMediaEngine::emit
pub struct MockMediaEngine {
    has_track: bool,
    tx: mpsc::UnboundedSender<MediaEngineEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEngineEvent>>>,
    applied: Mutex<Vec<RoapMessage>>,
    offers_initiated: AtomicUsize,
    muted: AtomicBool,
    digits: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockMediaEngine {
    pub fn new(has_track: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            has_track,
            tx,
            rx: Mutex::new(Some(rx)),
            applied: Mutex::new(Vec::new()),
            offers_initiated: AtomicUsize::new(0),
            muted: AtomicBool::new(false),
            digits: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, event: MediaEngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_roap(&self, message: RoapMessage) {
        self.emit(MediaEngineEvent::RoapMessageToSend(message));
    }

    pub fn applied(&self) -> Vec<RoapMessage> {
        self.applied.lock().clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn offers_initiated(&self) -> usize {
        self.offers_initiated.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn digits(&self) -> Vec<String> {
        self.digits.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    fn has_local_track(&self) -> bool {
        self.has_track
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEngineEvent>> {
        self.rx.lock().take()
    }

    async fn initiate_offer(&self) -> CallResult<()> {
        self.offers_initiated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_remote_message(&self, message: &RoapMessage) -> CallResult<()> {
        self.applied.lock().push(message.clone());
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> CallResult<()> {
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_dtmf(&self, tone: &str) -> CallResult<()> {
        self.digits.lock().push(tone.to_string());
        Ok(())
    }

    async fn rtp_stats(&self) -> CallRtpStats {
        CallRtpStats {
            packets_sent: 100,
            packets_received: 90,
            ..Default::default()
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Push envelope builders
// ---------------------------------------------------------------------------

fn base_envelope(event_type: PushEventType) -> PushEnvelope {
    PushEnvelope {
        event_type,
        correlation_id: None,
        call_id: None,
        device_id: DEVICE_ID.to_string(),
        call_progress_data: None,
        caller_id: None,
        broadworks_correlation_info: None,
        mid_call_service: None,
        message: None,
    }
}

pub fn setup_envelope(call_id: &str) -> PushEnvelope {
    PushEnvelope {
        call_id: Some(CallId::from(call_id)),
        caller_id: Some(CallerIdInfo {
            from: Some("\"Ada\" <sip:ada@example.com>".to_string()),
            ..Default::default()
        }),
        ..base_envelope(PushEventType::Setup)
    }
}

pub fn midcall_envelope(correlation_id: &CorrelationId, state: MidCallState) -> PushEnvelope {
    PushEnvelope {
        correlation_id: Some(correlation_id.clone()),
        call_id: Some(CallId::from(SERVER_CALL_ID)),
        mid_call_service: Some(vec![MidCallEntry::CallState { call_state: state }]),
        ..base_envelope(PushEventType::Setup)
    }
}

pub fn progress_envelope(correlation_id: &CorrelationId, inband_media: bool) -> PushEnvelope {
    PushEnvelope {
        correlation_id: Some(correlation_id.clone()),
        call_id: Some(CallId::from(SERVER_CALL_ID)),
        call_progress_data: Some(CallProgressData {
            alerting: true,
            inband_media,
        }),
        ..base_envelope(PushEventType::Progress)
    }
}

pub fn connected_envelope(correlation_id: &CorrelationId) -> PushEnvelope {
    PushEnvelope {
        correlation_id: Some(correlation_id.clone()),
        call_id: Some(CallId::from(SERVER_CALL_ID)),
        ..base_envelope(PushEventType::Connected)
    }
}

pub fn disconnected_envelope(correlation_id: &CorrelationId) -> PushEnvelope {
    PushEnvelope {
        correlation_id: Some(correlation_id.clone()),
        call_id: Some(CallId::from(SERVER_CALL_ID)),
        ..base_envelope(PushEventType::Disconnected)
    }
}

pub fn media_envelope(correlation_id: Option<&CorrelationId>, message: RoapMessage) -> PushEnvelope {
    PushEnvelope {
        correlation_id: correlation_id.cloned(),
        call_id: Some(CallId::from(SERVER_CALL_ID)),
        message: Some(message),
        ..base_envelope(PushEventType::Media)
    }
}

pub fn roap(message_type: RoapMessageType, seq: u32) -> RoapMessage {
    RoapMessage::new(message_type, seq).with_sdp("v=0")
}

// ---------------------------------------------------------------------------
// Waiting helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

pub async fn wait_for(condition: impl Fn() -> bool, what: &str) {
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

pub async fn wait_for_event(
    events: &mut broadcast::Receiver<CallEvent>,
    matches: impl Fn(&CallEvent) -> bool,
    what: &str,
) -> CallEvent {
    let result = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed while waiting for {what}")
                }
            }
        }
    })
    .await;
    match result {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

pub async fn wait_for_registry_event(
    events: &mut broadcast::Receiver<RegistryEvent>,
    matches: impl Fn(&RegistryEvent) -> bool,
    what: &str,
) -> RegistryEvent {
    let result = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("registry channel closed while waiting for {what}")
                }
            }
        }
    })
    .await;
    match result {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

// ---------------------------------------------------------------------------
// Call establishment helpers
// ---------------------------------------------------------------------------

/// Drive an outbound call to established: dial, offer/answer round, OK,
/// then the connect push from the server.
pub async fn establish_outbound(
    registry: &CallRegistry,
    transport: &Arc<MockTransport>,
) -> (
    Arc<Call>,
    Arc<MockMediaEngine>,
    broadcast::Receiver<CallEvent>,
) {
    let call = registry.create_call(DEVICE_ID.to_string(), CallTarget::tel("+15550100"));
    let mut events = call.subscribe();
    let engine = MockMediaEngine::new(true);
    call.dial(engine.clone());
    wait_for(|| engine.offers_initiated() > 0, "offer initiation").await;

    engine.emit_roap(roap(RoapMessageType::Offer, 1));
    wait_for(|| transport.create_count() == 1, "create request").await;

    let correlation_id = call.correlation_id().clone();
    registry.process_push(media_envelope(
        Some(&correlation_id),
        roap(RoapMessageType::Answer, 1),
    ));
    wait_for(|| engine.applied_count() >= 1, "remote answer applied").await;

    engine.emit_roap(RoapMessage::new(RoapMessageType::Ok, 1));
    wait_for(|| transport.media_count() >= 1, "OK posted").await;

    registry.process_push(connected_envelope(&correlation_id));
    wait_for_event(
        &mut events,
        |e| matches!(e, CallEvent::Established { .. }),
        "established event",
    )
    .await;
    (call, engine, events)
}

/// Drive an inbound call to established: setup push, alerting, remote
/// offer, answer, local answer, then the received OK.
pub async fn establish_inbound(
    registry: &CallRegistry,
    transport: &Arc<MockTransport>,
) -> (
    Arc<Call>,
    Arc<MockMediaEngine>,
    broadcast::Receiver<CallEvent>,
) {
    let mut registry_events = registry.subscribe();
    registry.process_push(setup_envelope(SERVER_CALL_ID));
    let incoming = wait_for_registry_event(
        &mut registry_events,
        |e| matches!(e, RegistryEvent::IncomingCall(_)),
        "incoming call",
    )
    .await;
    let RegistryEvent::IncomingCall(info) = incoming else {
        unreachable!();
    };
    let call = registry.get(&info.correlation_id).expect("admitted call");
    let mut events = call.subscribe();
    wait_for(|| transport.state_update_count() >= 1, "alerting update").await;

    registry.process_push(media_envelope(
        Some(&info.correlation_id),
        roap(RoapMessageType::Offer, 1),
    ));
    let engine = MockMediaEngine::new(true);
    call.answer(engine.clone());
    wait_for(|| engine.applied_count() >= 1, "buffered offer applied").await;
    wait_for(|| transport.state_update_count() >= 2, "connect update").await;

    engine.emit_roap(roap(RoapMessageType::Answer, 1));
    wait_for(|| transport.media_count() >= 1, "answer posted").await;

    registry.process_push(media_envelope(
        Some(&info.correlation_id),
        RoapMessage::new(RoapMessageType::Ok, 1),
    ));
    wait_for_event(
        &mut events,
        |e| matches!(e, CallEvent::Established { .. }),
        "established event",
    )
    .await;
    (call, engine, events)
}
