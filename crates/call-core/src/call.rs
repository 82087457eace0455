//! Per-call control.
//!
//! Each call runs as its own tokio task. The task owns all mutable call
//! state: the two state machines, the ROAP [`Sequencer`], the attached
//! media engine and the background timers. Everything else talks to the
//! task through an unbounded channel of [`EngineInput`]s, so handlers never
//! race each other. Events that a handler produces for its own call are
//! pushed onto an internal queue and processed before anything new is read
//! from the channel, which keeps cascades (setup -> alerting, disconnect ->
//! cleared) atomic with respect to outside input.
//!
//! The public [`Call`] handle is a thin, cloneable front: it exposes
//! read-only state through atomics and forwards commands into the task.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{FailureKind, TransportError};
use crate::events::{CallErrorInfo, CallEvent};
use crate::retry::{FailureAction, classify, surface};
use crate::sequencer::{RemoteDecision, Sequencer};
use crate::state_table::{
    CallEventKind, CallState, MediaEventKind, MediaState, call_lookup, media_lookup,
};
use crate::traits::{
    CallerIdResolver, MediaEngine, MediaEngineEvent, MetricKind, MetricRecord, MetricsReporter,
    SignalingTransport,
};
use crate::types::{
    CallDirection, CallId, CallRtpStats, CallTarget, CallerIdentity, CorrelationId, DeviceId,
    DisconnectReason, LineId,
};
use crate::wire::{
    CallStatePatch, CallStatusRequest, CallerIdInfo, CreateCallRequest, DeleteCallRequest,
    DeviceInfo, LocalMedia, MediaRequest, RoapMessage, RoapMessageType, SignalState,
};

/// Details carried by a progress notification.
#[derive(Debug, Clone, Default)]
pub struct ProgressInfo {
    pub inband_media: bool,
    pub caller_id: Option<CallerIdInfo>,
}

/// Events feeding the call-control machine.
#[derive(Debug, Clone)]
pub(crate) enum CallMachineEvent {
    RecvSetup,
    SendSetup(RoapMessage),
    SendAlerting,
    RecvProgress(ProgressInfo),
    RecvConnect,
    SendConnect,
    Established,
    Hold,
    Resume,
    RecvDisconnect,
    SendDisconnect,
    Unknown { media_error: bool },
    Cleared,
}

impl CallMachineEvent {
    fn kind(&self) -> CallEventKind {
        match self {
            CallMachineEvent::RecvSetup => CallEventKind::RecvSetup,
            CallMachineEvent::SendSetup(_) => CallEventKind::SendSetup,
            CallMachineEvent::SendAlerting => CallEventKind::SendAlerting,
            CallMachineEvent::RecvProgress(_) => CallEventKind::RecvProgress,
            CallMachineEvent::RecvConnect => CallEventKind::RecvConnect,
            CallMachineEvent::SendConnect => CallEventKind::SendConnect,
            CallMachineEvent::Established => CallEventKind::Established,
            CallMachineEvent::Hold => CallEventKind::Hold,
            CallMachineEvent::Resume => CallEventKind::Resume,
            CallMachineEvent::RecvDisconnect => CallEventKind::RecvDisconnect,
            CallMachineEvent::SendDisconnect => CallEventKind::SendDisconnect,
            CallMachineEvent::Unknown { .. } => CallEventKind::Unknown,
            CallMachineEvent::Cleared => CallEventKind::Cleared,
        }
    }
}

/// Events feeding the media negotiation machine.
#[derive(Debug, Clone)]
pub(crate) enum MediaMachineEvent {
    RecvOfferRequest(RoapMessage),
    RecvOffer(RoapMessage),
    SendOffer(Option<RoapMessage>),
    RecvAnswer(RoapMessage),
    SendAnswer(RoapMessage),
    Ok { received: bool, message: RoapMessage },
    Error(Option<RoapMessage>),
    Teardown,
}

impl MediaMachineEvent {
    fn kind(&self) -> MediaEventKind {
        match self {
            MediaMachineEvent::RecvOfferRequest(_) => MediaEventKind::RecvOfferRequest,
            MediaMachineEvent::RecvOffer(_) => MediaEventKind::RecvOffer,
            MediaMachineEvent::SendOffer(_) => MediaEventKind::SendOffer,
            MediaMachineEvent::RecvAnswer(_) => MediaEventKind::RecvAnswer,
            MediaMachineEvent::SendAnswer(_) => MediaEventKind::SendAnswer,
            MediaMachineEvent::Ok { .. } => MediaEventKind::Ok,
            MediaMachineEvent::Error(_) => MediaEventKind::Error,
            MediaMachineEvent::Teardown => MediaEventKind::Teardown,
        }
    }
}

/// User-initiated operations that need the media engine.
pub(crate) enum CallCommand {
    Dial(Arc<dyn MediaEngine>),
    Answer(Arc<dyn MediaEngine>),
    ToggleMute,
    SendDigit(String),
}

impl fmt::Debug for CallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallCommand::Dial(_) => write!(f, "Dial"),
            CallCommand::Answer(_) => write!(f, "Answer"),
            CallCommand::ToggleMute => write!(f, "ToggleMute"),
            CallCommand::SendDigit(tone) => write!(f, "SendDigit({tone})"),
        }
    }
}

/// Everything the call task consumes.
pub(crate) enum EngineInput {
    Call(CallMachineEvent),
    Media(MediaMachineEvent),
    Command(CallCommand),
    SessionRefreshFailed(TransportError),
}

/// Invoked when the call must leave the registry.
pub(crate) type RemoveCallback = Arc<dyn Fn(&CorrelationId) + Send + Sync>;

/// State shared between the call task, the public handle and background
/// timers. Flags are atomics because the mid-call confirmation path writes
/// them from outside the task.
pub(crate) struct CallShared {
    pub correlation_id: CorrelationId,
    pub device_id: DeviceId,
    pub line_id: LineId,
    pub direction: CallDirection,
    pub call_id: RwLock<CallId>,
    pub connected: AtomicBool,
    pub held: AtomicBool,
    pub muted: AtomicBool,
    pub broadworks_correlation_info: RwLock<Option<String>>,
    pub supplementary_timer: Mutex<Option<JoinHandle<()>>>,
    pub events: broadcast::Sender<CallEvent>,
    pub transport: Arc<dyn SignalingTransport>,
    pub resolver: Arc<dyn CallerIdResolver>,
    pub metrics: Arc<dyn MetricsReporter>,
    pub config: EngineConfig,
}

impl CallShared {
    pub fn device(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id.read().clone()
    }

    pub fn set_call_id(&self, call_id: CallId) {
        *self.call_id.write() = call_id;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Send an event to subscribers. Nobody listening is not an error.
    pub fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    pub fn record_metric(&self, kind: MetricKind, label: impl Into<String>) {
        self.metrics.record(MetricRecord {
            kind,
            label: label.into(),
            correlation_id: self.correlation_id.clone(),
            call_id: self.call_id(),
        });
    }

    pub fn cancel_supplementary_timer(&self) {
        if let Some(handle) = self.supplementary_timer.lock().take() {
            handle.abort();
        }
    }

    /// Emit the raw identity immediately, then refine it asynchronously
    /// through the resolver.
    pub fn start_caller_id_resolution(self: &Arc<Self>, raw: CallerIdInfo) {
        self.emit(CallEvent::CallerId {
            correlation_id: self.correlation_id.clone(),
            caller: raw_identity(&raw),
        });
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(resolved) = shared.resolver.resolve(&raw).await {
                shared.emit(CallEvent::CallerId {
                    correlation_id: shared.correlation_id.clone(),
                    caller: resolved,
                });
            }
        });
    }
}

/// Best-effort identity from raw signaling headers.
fn raw_identity(raw: &CallerIdInfo) -> CallerIdentity {
    let source = raw
        .p_asserted_identity
        .as_deref()
        .or(raw.from.as_deref())
        .unwrap_or("");
    CallerIdentity {
        name: display_name(source),
        number: address(source),
        avatar_url: None,
        user_id: None,
    }
}

fn display_name(header: &str) -> Option<String> {
    let start = header.find('"')?;
    let rest = &header[start + 1..];
    let end = rest.find('"')?;
    let name = rest[..end].trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn address(header: &str) -> Option<String> {
    let scheme = header.find("sip:").or_else(|| header.find("tel:"))?;
    let rest = &header[scheme + 4..];
    let end = rest.find(['@', '>', ';']).unwrap_or(rest.len());
    let addr = rest[..end].trim();
    (!addr.is_empty()).then(|| addr.to_string())
}

/// Handle to a live call.
///
/// Cheap to clone via `Arc`; all mutation happens inside the call task.
pub struct Call {
    pub(crate) shared: Arc<CallShared>,
    pub(crate) tx: mpsc::UnboundedSender<EngineInput>,
}

impl Call {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        config: EngineConfig,
        transport: Arc<dyn SignalingTransport>,
        resolver: Arc<dyn CallerIdResolver>,
        metrics: Arc<dyn MetricsReporter>,
        direction: CallDirection,
        device_id: DeviceId,
        line_id: LineId,
        destination: Option<CallTarget>,
        remove: RemoveCallback,
    ) -> Arc<Call> {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CallShared {
            correlation_id: CorrelationId::new(),
            device_id,
            line_id,
            direction,
            call_id: RwLock::new(CallId::local(&config.local_call_id_prefix)),
            connected: AtomicBool::new(false),
            held: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            broadworks_correlation_info: RwLock::new(None),
            supplementary_timer: Mutex::new(None),
            events,
            transport,
            resolver,
            metrics,
            config,
        });
        let engine = CallEngine {
            shared: Arc::clone(&shared),
            rx,
            tx: tx.clone(),
            pending: VecDeque::new(),
            call_state: CallState::Idle,
            media_state: MediaState::Idle,
            sequencer: Sequencer::new(),
            destination,
            media: None,
            media_pump: None,
            session_refresh: None,
            early_media: false,
            media_inactivity: false,
            media_negotiation_completed: false,
            torn_down: false,
            remove,
        };
        tokio::spawn(engine.run());
        Arc::new(Call { shared, tx })
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.shared.correlation_id
    }

    pub fn call_id(&self) -> CallId {
        self.shared.call_id()
    }

    pub fn direction(&self) -> CallDirection {
        self.shared.direction
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.shared.device_id
    }

    pub fn line_id(&self) -> &LineId {
        &self.shared.line_id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_held(&self) -> bool {
        self.shared.is_held()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.is_muted()
    }

    /// Pass-through correlation info for BroadWorks deployments.
    pub fn broadworks_correlation_info(&self) -> Option<String> {
        self.shared.broadworks_correlation_info.read().clone()
    }

    /// Subscribe to this call's events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    /// Start an outbound call with the given media engine.
    pub fn dial(&self, engine: Arc<dyn MediaEngine>) {
        self.send(EngineInput::Command(CallCommand::Dial(engine)));
    }

    /// Answer an inbound call with the given media engine.
    pub fn answer(&self, engine: Arc<dyn MediaEngine>) {
        self.send(EngineInput::Command(CallCommand::Answer(engine)));
    }

    /// Hang up.
    pub fn end(&self) {
        self.send(EngineInput::Call(CallMachineEvent::SendDisconnect));
    }

    /// Toggle between hold and resume based on the current held state.
    pub fn do_hold_resume(&self) {
        if self.shared.is_held() {
            self.send(EngineInput::Call(CallMachineEvent::Resume));
        } else {
            self.send(EngineInput::Call(CallMachineEvent::Hold));
        }
    }

    /// Toggle the local audio mute state.
    pub fn toggle_mute(&self) {
        self.send(EngineInput::Command(CallCommand::ToggleMute));
    }

    /// Send a DTMF digit on the established call.
    pub fn send_digit(&self, tone: impl Into<String>) {
        self.send(EngineInput::Command(CallCommand::SendDigit(tone.into())));
    }

    pub(crate) fn send(&self, input: EngineInput) {
        if self.tx.send(input).is_err() {
            debug!(
                correlation_id = %self.shared.correlation_id,
                "call task already finished, dropping input"
            );
        }
    }

    pub(crate) fn send_call_event(&self, event: CallMachineEvent) {
        self.send(EngineInput::Call(event));
    }

    pub(crate) fn send_media_event(&self, event: MediaMachineEvent) {
        self.send(EngineInput::Media(event));
    }

    pub(crate) fn set_call_id(&self, call_id: CallId) {
        self.shared.set_call_id(call_id);
    }

    pub(crate) fn set_broadworks_correlation_info(&self, info: Option<String>) {
        if info.is_some() {
            *self.shared.broadworks_correlation_info.write() = info;
        }
    }

    pub(crate) fn start_caller_id_resolution(&self, raw: CallerIdInfo) {
        self.shared.start_caller_id_resolution(raw);
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("correlation_id", &self.shared.correlation_id)
            .field("call_id", &self.shared.call_id())
            .field("direction", &self.shared.direction)
            .finish()
    }
}

/// The call task. Owns every piece of mutable call state.
pub(crate) struct CallEngine {
    pub(crate) shared: Arc<CallShared>,
    rx: mpsc::UnboundedReceiver<EngineInput>,
    pub(crate) tx: mpsc::UnboundedSender<EngineInput>,
    /// Inputs generated by handlers for this call, drained before the
    /// channel is read again.
    pending: VecDeque<EngineInput>,
    pub(crate) call_state: CallState,
    media_state: MediaState,
    sequencer: Sequencer,
    destination: Option<CallTarget>,
    media: Option<Arc<dyn MediaEngine>>,
    media_pump: Option<JoinHandle<()>>,
    session_refresh: Option<JoinHandle<()>>,
    early_media: bool,
    media_inactivity: bool,
    media_negotiation_completed: bool,
    torn_down: bool,
    remove: RemoveCallback,
}

impl CallEngine {
    async fn run(mut self) {
        debug!(
            correlation_id = %self.shared.correlation_id,
            direction = %self.shared.direction,
            "call task started"
        );
        loop {
            let input = match self.pending.pop_front() {
                Some(input) => input,
                None => match self.rx.recv().await {
                    Some(input) => input,
                    None => break,
                },
            };
            self.handle_input(input).await;
            if self.call_state.is_terminal() && self.pending.is_empty() {
                break;
            }
        }
        if let Some(handle) = self.session_refresh.take() {
            handle.abort();
        }
        if let Some(handle) = self.media_pump.take() {
            handle.abort();
        }
        self.shared.cancel_supplementary_timer();
        debug!(correlation_id = %self.shared.correlation_id, "call task finished");
    }

    async fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Call(event) => self.dispatch_call_event(event).await,
            EngineInput::Media(event) => self.dispatch_media_event(event).await,
            EngineInput::Command(command) => self.handle_command(command).await,
            EngineInput::SessionRefreshFailed(error) => {
                self.handle_session_refresh_failure(error);
            }
        }
    }

    pub(crate) fn enqueue_call(&mut self, event: CallMachineEvent) {
        self.pending.push_back(EngineInput::Call(event));
    }

    fn enqueue_media(&mut self, event: MediaMachineEvent) {
        self.pending.push_back(EngineInput::Media(event));
    }

    // -----------------------------------------------------------------
    // Call-control machine
    // -----------------------------------------------------------------

    async fn dispatch_call_event(&mut self, event: CallMachineEvent) {
        let kind = event.kind();
        let Some(transition) = call_lookup(self.call_state, kind) else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                state = %self.call_state,
                event = ?kind,
                "call event not accepted in this state, dropping"
            );
            return;
        };
        debug!(
            correlation_id = %self.shared.correlation_id,
            from = %self.call_state,
            to = %transition.next,
            event = ?kind,
            "call state transition"
        );
        self.call_state = transition.next;
        if transition.next != CallState::Unknown {
            self.shared
                .record_metric(MetricKind::CallState, transition.next.to_string());
        }
        match event {
            CallMachineEvent::RecvSetup => self.on_incoming_setup(),
            CallMachineEvent::SendSetup(offer) => self.on_outgoing_setup(offer).await,
            CallMachineEvent::SendAlerting => self.on_outgoing_alerting().await,
            CallMachineEvent::RecvProgress(info) => self.on_incoming_progress(info),
            CallMachineEvent::RecvConnect => self.on_incoming_connect(),
            CallMachineEvent::SendConnect => self.on_outgoing_connect().await,
            CallMachineEvent::Established => self.on_established(),
            CallMachineEvent::Hold => self.on_initiate_hold().await,
            CallMachineEvent::Resume => self.on_initiate_resume().await,
            CallMachineEvent::RecvDisconnect => self.on_incoming_disconnect().await,
            CallMachineEvent::SendDisconnect => self.on_outgoing_disconnect().await,
            CallMachineEvent::Unknown { media_error } => self.on_unknown(media_error).await,
            CallMachineEvent::Cleared => {}
        }
    }

    fn on_incoming_setup(&mut self) {
        self.enqueue_call(CallMachineEvent::SendAlerting);
    }

    async fn on_outgoing_setup(&mut self, offer: RoapMessage) {
        let Some(callee) = self.destination.clone() else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "outbound setup without a destination, dropping"
            );
            return;
        };
        let request = CreateCallRequest {
            device: self.shared.device(),
            callee,
            local_media: LocalMedia::new(offer),
        };
        match self.shared.transport.create_call(&request).await {
            Ok(response) => {
                info!(
                    correlation_id = %self.shared.correlation_id,
                    call_id = %response.call_id,
                    "call created on server"
                );
                self.shared.set_call_id(response.call_id);
            }
            Err(error) => self.fail_signaling("call setup", &error),
        }
    }

    async fn on_outgoing_alerting(&mut self) {
        let request = CallStatePatch {
            device: self.shared.device(),
            call_id: self.shared.call_id(),
            call_state: SignalState::Alerting,
            inband_media: false,
        };
        if let Err(error) = self.shared.transport.update_call_state(&request).await {
            self.fail_signaling("alerting update", &error);
        }
    }

    fn on_incoming_progress(&mut self, info: ProgressInfo) {
        if info.inband_media {
            self.early_media = true;
        }
        if let Some(raw) = info.caller_id {
            self.shared.start_caller_id_resolution(raw);
        }
        self.shared.emit(CallEvent::Progress {
            correlation_id: self.shared.correlation_id.clone(),
        });
    }

    fn on_incoming_connect(&mut self) {
        self.shared.emit(CallEvent::Connect {
            correlation_id: self.shared.correlation_id.clone(),
        });
        if self.early_media || self.media_negotiation_completed {
            self.media_negotiation_completed = false;
            self.enqueue_call(CallMachineEvent::Established);
        }
    }

    async fn on_outgoing_connect(&mut self) {
        match self.sequencer.buffered().cloned() {
            Some(buffered) => self.apply_to_engine(&buffered).await,
            None => warn!(
                correlation_id = %self.shared.correlation_id,
                "answering with no buffered remote media message"
            ),
        }
        let request = CallStatePatch {
            device: self.shared.device(),
            call_id: self.shared.call_id(),
            call_state: SignalState::Connected,
            inband_media: false,
        };
        if let Err(error) = self.shared.transport.update_call_state(&request).await {
            self.fail_signaling("connect update", &error);
        }
    }

    fn on_established(&mut self) {
        self.shared.connected.store(true, Ordering::SeqCst);
        self.early_media = false;
        self.shared.emit(CallEvent::Established {
            correlation_id: self.shared.correlation_id.clone(),
        });
        self.start_session_refresh();
    }

    async fn on_incoming_disconnect(&mut self) {
        self.shared.emit(CallEvent::Disconnect {
            correlation_id: self.shared.correlation_id.clone(),
        });
        self.teardown().await;
    }

    async fn on_outgoing_disconnect(&mut self) {
        self.teardown().await;
    }

    async fn on_unknown(&mut self, media_error: bool) {
        if media_error {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "call failed due to a media negotiation error"
            );
        } else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "call failed due to a signaling error"
            );
        }
        self.teardown().await;
    }

    /// Delete the call on the server, release local resources and drive
    /// both machines to their terminal states.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let reason = DisconnectReason::derive(
            self.media_inactivity,
            self.shared.is_connected(),
            self.shared.direction,
        );
        let stats = match &self.media {
            Some(engine) => engine.rtp_stats().await,
            None => CallRtpStats::default(),
        };
        let request = DeleteCallRequest {
            device: self.shared.device(),
            call_id: self.shared.call_id(),
            metrics: stats,
            causecode: reason.code,
            cause: reason.cause.to_string(),
        };
        info!(
            correlation_id = %self.shared.correlation_id,
            causecode = reason.code,
            "deleting call"
        );
        if let Err(error) = self.shared.transport.delete_call(&request).await {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "failed to delete the call on the server: {error}"
            );
        }
        (self.remove)(&self.shared.correlation_id);
        if let Some(handle) = self.session_refresh.take() {
            handle.abort();
        }
        self.shared.cancel_supplementary_timer();
        if let Some(handle) = self.media_pump.take() {
            handle.abort();
        }
        if let Some(engine) = self.media.take() {
            engine.close().await;
        }
        self.enqueue_media(MediaMachineEvent::Teardown);
        self.enqueue_call(CallMachineEvent::Cleared);
    }

    fn fail_signaling(&mut self, context: &str, error: &TransportError) {
        let (kind, message) = surface(error);
        warn!(
            correlation_id = %self.shared.correlation_id,
            %kind,
            "{context} failed: {error}"
        );
        self.shared.record_metric(MetricKind::CallError, kind.to_string());
        self.shared.emit(CallEvent::CallError {
            correlation_id: self.shared.correlation_id.clone(),
            error: CallErrorInfo::new(kind, message),
        });
        self.enqueue_call(CallMachineEvent::Unknown { media_error: false });
    }

    fn start_session_refresh(&mut self) {
        if let Some(handle) = self.session_refresh.take() {
            handle.abort();
        }
        let transport = Arc::clone(&self.shared.transport);
        let request = CallStatusRequest {
            device: self.shared.device(),
            call_id: self.shared.call_id(),
        };
        let interval = self.shared.config.session_refresh_interval;
        let correlation_id = self.shared.correlation_id.clone();
        let tx = self.tx.clone();
        self.session_refresh = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match transport.post_status(&request).await {
                    Ok(()) => {
                        debug!(%correlation_id, "session refresh succeeded");
                    }
                    Err(error) => {
                        warn!(%correlation_id, "session refresh failed: {error}");
                        let _ = tx.send(EngineInput::SessionRefreshFailed(error));
                        break;
                    }
                }
            }
        }));
    }

    fn handle_session_refresh_failure(&mut self, error: TransportError) {
        match classify(&error) {
            FailureAction::Retry { after } if self.shared.is_connected() => {
                warn!(
                    correlation_id = %self.shared.correlation_id,
                    "retrying session refresh in {}s",
                    after.as_secs()
                );
                let transport = Arc::clone(&self.shared.transport);
                let request = CallStatusRequest {
                    device: self.shared.device(),
                    call_id: self.shared.call_id(),
                };
                let correlation_id = self.shared.correlation_id.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    match transport.post_status(&request).await {
                        Ok(()) => {
                            // Re-arms the refresh timer through the
                            // established handler.
                            let _ = tx.send(EngineInput::Call(CallMachineEvent::Established));
                        }
                        Err(error) => {
                            warn!(%correlation_id, "session refresh retry failed: {error}");
                        }
                    }
                });
            }
            FailureAction::Retry { .. } => {
                debug!(
                    correlation_id = %self.shared.correlation_id,
                    "dropping session refresh retry, call not connected"
                );
            }
            FailureAction::Surface { kind, message } => {
                self.shared.record_metric(MetricKind::CallError, kind.to_string());
                self.shared.emit(CallEvent::CallError {
                    correlation_id: self.shared.correlation_id.clone(),
                    error: CallErrorInfo::new(kind, message),
                });
            }
        }
    }

    // -----------------------------------------------------------------
    // Media negotiation machine
    // -----------------------------------------------------------------

    async fn dispatch_media_event(&mut self, event: MediaMachineEvent) {
        let kind = event.kind();
        let Some(transition) = media_lookup(self.media_state, kind) else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                state = %self.media_state,
                event = ?kind,
                "media event not accepted in this state, dropping"
            );
            return;
        };
        debug!(
            correlation_id = %self.shared.correlation_id,
            from = %self.media_state,
            to = %transition.next,
            event = ?kind,
            "media state transition"
        );
        self.media_state = transition.next;
        if transition.next != MediaState::Error {
            self.shared
                .record_metric(MetricKind::MediaState, transition.next.to_string());
        }
        match event {
            MediaMachineEvent::RecvOfferRequest(message) => {
                self.on_incoming_offer_request(message).await;
            }
            MediaMachineEvent::RecvOffer(message) => self.on_incoming_offer(message).await,
            MediaMachineEvent::SendOffer(message) => self.on_outgoing_offer(message).await,
            MediaMachineEvent::RecvAnswer(message) => self.on_incoming_answer(message).await,
            MediaMachineEvent::SendAnswer(message) => self.on_outgoing_answer(message).await,
            MediaMachineEvent::Ok { received, message } => {
                self.on_roap_ok(received, message).await;
            }
            MediaMachineEvent::Error(message) => self.on_roap_error(message).await,
            MediaMachineEvent::Teardown => {}
        }
    }

    async fn on_incoming_offer(&mut self, message: RoapMessage) {
        let decision = self
            .sequencer
            .classify_remote(message.seq, self.media.is_some());
        self.sequencer.buffer(message.clone());
        match decision {
            RemoteDecision::BufferUninitialized => {
                debug!(
                    correlation_id = %self.shared.correlation_id,
                    seq = message.seq,
                    "media engine not attached yet, buffering remote offer"
                );
                self.sequencer.adopt(message.seq);
            }
            RemoteDecision::BufferAhead => {
                debug!(
                    correlation_id = %self.shared.correlation_id,
                    seq = message.seq,
                    ok_seq = self.sequencer.received_ok_seq(),
                    "remote offer is a round ahead, holding back"
                );
            }
            RemoteDecision::Apply => {
                self.sequencer.adopt(message.seq);
                self.apply_to_engine(&message).await;
            }
        }
    }

    async fn on_incoming_offer_request(&mut self, message: RoapMessage) {
        match self
            .sequencer
            .classify_remote(message.seq, self.media.is_some())
        {
            RemoteDecision::BufferUninitialized => {
                debug!(
                    correlation_id = %self.shared.correlation_id,
                    seq = message.seq,
                    "media engine not attached yet, buffering offer request"
                );
                self.sequencer.adopt(message.seq);
                self.sequencer.buffer(message);
            }
            RemoteDecision::BufferAhead => {
                debug!(
                    correlation_id = %self.shared.correlation_id,
                    seq = message.seq,
                    "offer request is a round ahead, holding back"
                );
                self.sequencer.buffer(message);
            }
            RemoteDecision::Apply => {
                let mut message = message;
                message.seq = self.sequencer.next_round();
                self.apply_to_engine(&message).await;
            }
        }
    }

    async fn on_incoming_answer(&mut self, message: RoapMessage) {
        self.sequencer.buffer(message.clone());
        let mut message = message;
        message.seq = self.sequencer.local_seq();
        self.apply_to_engine(&message).await;
    }

    async fn on_outgoing_offer(&mut self, message: Option<RoapMessage>) {
        let Some(offer) = message.filter(|m| m.sdp.is_some()) else {
            match &self.media {
                Some(engine) => {
                    if let Err(error) = engine.initiate_offer().await {
                        warn!(
                            correlation_id = %self.shared.correlation_id,
                            "failed to initiate local offer: {error}"
                        );
                    }
                }
                None => warn!(
                    correlation_id = %self.shared.correlation_id,
                    "no media engine attached, cannot create offer"
                ),
            }
            return;
        };
        let retry = EngineInput::Media(MediaMachineEvent::SendOffer(Some(offer.clone())));
        let request = MediaRequest {
            device: self.shared.device(),
            call_id: self.shared.call_id(),
            local_media: LocalMedia::new(offer),
        };
        if let Err(error) = self.shared.transport.post_media(&request).await {
            self.fail_media(error, retry);
        }
    }

    async fn on_outgoing_answer(&mut self, message: RoapMessage) {
        let mut message = message;
        message.seq = self.sequencer.local_seq();
        let retry = EngineInput::Media(MediaMachineEvent::SendAnswer(message.clone()));
        let request = MediaRequest {
            device: self.shared.device(),
            call_id: self.shared.call_id(),
            local_media: LocalMedia::new(message),
        };
        if let Err(error) = self.shared.transport.post_media(&request).await {
            self.fail_media(error, retry);
        }
    }

    async fn on_roap_ok(&mut self, received: bool, message: RoapMessage) {
        self.sequencer.record_ok(message.seq);
        let mut message = message;
        if received {
            message.seq = self.sequencer.local_seq();
            self.apply_to_engine(&message).await;
            if !self.early_media {
                self.enqueue_call(CallMachineEvent::Established);
            }
            if let Some(pending) = self.sequencer.buffered_ahead() {
                debug!(
                    correlation_id = %self.shared.correlation_id,
                    seq = pending.seq,
                    "replaying buffered remote message after OK"
                );
                match pending.message_type {
                    RoapMessageType::Offer => {
                        self.enqueue_media(MediaMachineEvent::RecvOffer(pending));
                    }
                    RoapMessageType::OfferRequest => {
                        self.enqueue_media(MediaMachineEvent::RecvOfferRequest(pending));
                    }
                    _ => {}
                }
            }
        } else {
            if matches!(
                self.call_state,
                CallState::SendSetup | CallState::RecvProgress
            ) {
                info!(
                    correlation_id = %self.shared.correlation_id,
                    "media negotiation completed before connect"
                );
                self.media_negotiation_completed = true;
            }
            message.seq = self.sequencer.local_seq();
            let retry = EngineInput::Media(MediaMachineEvent::Ok {
                received: false,
                message: message.clone(),
            });
            let request = MediaRequest {
                device: self.shared.device(),
                call_id: self.shared.call_id(),
                local_media: LocalMedia::new(message),
            };
            match self.shared.transport.post_media(&request).await {
                Ok(()) => {
                    if !self.early_media && !self.media_negotiation_completed {
                        self.enqueue_call(CallMachineEvent::Established);
                    }
                }
                Err(error) => self.fail_media(error, retry),
            }
        }
    }

    async fn on_roap_error(&mut self, message: Option<RoapMessage>) {
        if let Some(message) = message {
            warn!(
                correlation_id = %self.shared.correlation_id,
                error_type = ?message.error_type,
                "reporting ROAP error to server"
            );
            let request = MediaRequest {
                device: self.shared.device(),
                call_id: self.shared.call_id(),
                local_media: LocalMedia::new(message),
            };
            if let Err(error) = self.shared.transport.post_media(&request).await {
                let (kind, msg) = surface(&error);
                self.shared
                    .record_metric(MetricKind::MediaError, kind.to_string());
                self.shared.emit(CallEvent::CallError {
                    correlation_id: self.shared.correlation_id.clone(),
                    error: CallErrorInfo::new(kind, msg),
                });
            }
        }
        if !self.shared.is_connected() {
            self.enqueue_call(CallMachineEvent::Unknown { media_error: true });
        }
    }

    async fn apply_to_engine(&mut self, message: &RoapMessage) {
        let Some(engine) = &self.media else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "no media engine attached, cannot apply remote message"
            );
            return;
        };
        if let Err(error) = engine.apply_remote_message(message).await {
            warn!(
                correlation_id = %self.shared.correlation_id,
                seq = message.seq,
                "media engine rejected remote message: {error}"
            );
        }
    }

    /// Decide what to do about a failed media post. Transient failures
    /// (403/503 with Retry-After) are resent once, but only while the call
    /// is connected.
    fn fail_media(&mut self, error: TransportError, retry: EngineInput) {
        match classify(&error) {
            FailureAction::Retry { after } if self.shared.is_connected() => {
                warn!(
                    correlation_id = %self.shared.correlation_id,
                    "transient media failure, retrying in {}s",
                    after.as_secs()
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(retry);
                });
            }
            FailureAction::Retry { .. } => {
                // Retry-After on a pre-connect media post is not honored.
                debug!(
                    correlation_id = %self.shared.correlation_id,
                    "dropping media retry, call not connected"
                );
            }
            FailureAction::Surface { kind, message } => self.surface_in_context(kind, message),
        }
    }

    /// Route a surfaced failure according to the call state it happened in.
    pub(crate) fn surface_in_context(&mut self, kind: FailureKind, message: String) {
        let info = CallErrorInfo::new(kind, message);
        match self.call_state {
            CallState::Hold => {
                self.shared.record_metric(MetricKind::CallError, kind.to_string());
                self.shared.cancel_supplementary_timer();
                self.shared.emit(CallEvent::HoldError {
                    correlation_id: self.shared.correlation_id.clone(),
                    error: info,
                });
                self.enqueue_call(CallMachineEvent::Established);
            }
            CallState::Resume => {
                self.shared.record_metric(MetricKind::CallError, kind.to_string());
                self.shared.emit(CallEvent::ResumeError {
                    correlation_id: self.shared.correlation_id.clone(),
                    error: info,
                });
                self.enqueue_call(CallMachineEvent::Established);
            }
            _ => {
                self.shared.record_metric(MetricKind::CallError, kind.to_string());
                self.shared.emit(CallEvent::CallError {
                    correlation_id: self.shared.correlation_id.clone(),
                    error: info,
                });
                if !self.shared.is_connected() {
                    self.enqueue_media(MediaMachineEvent::Error(None));
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Dial(engine) => self.handle_dial(engine),
            CallCommand::Answer(engine) => self.handle_answer(engine),
            CallCommand::ToggleMute => self.handle_mute().await,
            CallCommand::SendDigit(tone) => self.handle_digit(&tone).await,
        }
    }

    fn handle_dial(&mut self, engine: Arc<dyn MediaEngine>) {
        if self.call_state != CallState::Idle {
            warn!(
                correlation_id = %self.shared.correlation_id,
                state = %self.call_state,
                "call cannot be dialed in this state"
            );
            return;
        }
        if !engine.has_local_track() {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "no local audio track available, abandoning call"
            );
            (self.remove)(&self.shared.correlation_id);
            self.shared.emit(CallEvent::Disconnect {
                correlation_id: self.shared.correlation_id.clone(),
            });
            self.call_state = CallState::Cleared;
            return;
        }
        self.attach_media(engine);
        if self.media_state == MediaState::Idle {
            self.enqueue_media(MediaMachineEvent::SendOffer(None));
        } else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                media_state = %self.media_state,
                "media negotiation already started"
            );
        }
    }

    fn handle_answer(&mut self, engine: Arc<dyn MediaEngine>) {
        if !engine.has_local_track() {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "no local audio track available, disconnecting call"
            );
            self.media_inactivity = true;
            self.enqueue_call(CallMachineEvent::SendDisconnect);
            return;
        }
        self.attach_media(engine);
        if self.call_state == CallState::SendProgress {
            self.enqueue_call(CallMachineEvent::SendConnect);
        } else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                state = %self.call_state,
                "call cannot be answered in this state"
            );
        }
    }

    /// Attach the media engine and start pumping its events into the task.
    fn attach_media(&mut self, engine: Arc<dyn MediaEngine>) {
        if self.media.is_some() {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "media engine already attached"
            );
            return;
        }
        match engine.take_events() {
            Some(mut events) => {
                let tx = self.tx.clone();
                let shared = Arc::clone(&self.shared);
                self.media_pump = Some(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        match event {
                            MediaEngineEvent::RoapMessageToSend(message) => {
                                let input = match message.message_type {
                                    RoapMessageType::Offer => {
                                        EngineInput::Call(CallMachineEvent::SendSetup(message))
                                    }
                                    RoapMessageType::Answer => {
                                        EngineInput::Media(MediaMachineEvent::SendAnswer(message))
                                    }
                                    RoapMessageType::Ok => EngineInput::Media(MediaMachineEvent::Ok {
                                        received: false,
                                        message,
                                    }),
                                    RoapMessageType::Error => {
                                        EngineInput::Media(MediaMachineEvent::Error(Some(message)))
                                    }
                                    RoapMessageType::OfferResponse => {
                                        EngineInput::Media(MediaMachineEvent::SendOffer(Some(
                                            message,
                                        )))
                                    }
                                    RoapMessageType::OfferRequest => {
                                        debug!(
                                            correlation_id = %shared.correlation_id,
                                            "ignoring OFFER_REQUEST produced by local engine"
                                        );
                                        continue;
                                    }
                                };
                                if tx.send(input).is_err() {
                                    break;
                                }
                            }
                            MediaEngineEvent::RemoteTrackAdded(track) => {
                                shared.emit(CallEvent::RemoteMedia {
                                    correlation_id: shared.correlation_id.clone(),
                                    track,
                                });
                            }
                        }
                    }
                }));
            }
            None => warn!(
                correlation_id = %self.shared.correlation_id,
                "media engine event stream already taken"
            ),
        }
        self.media = Some(engine);
    }

    async fn handle_mute(&mut self) {
        let Some(engine) = &self.media else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "no media engine attached, cannot toggle mute"
            );
            return;
        };
        let target = !self.shared.is_muted();
        match engine.set_muted(target).await {
            Ok(()) => {
                self.shared.muted.store(target, Ordering::SeqCst);
                info!(
                    correlation_id = %self.shared.correlation_id,
                    muted = target,
                    "mute toggled"
                );
            }
            Err(error) => warn!(
                correlation_id = %self.shared.correlation_id,
                "failed to toggle mute: {error}"
            ),
        }
    }

    async fn handle_digit(&mut self, tone: &str) {
        let Some(engine) = &self.media else {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "no media engine attached, cannot send digit"
            );
            return;
        };
        if let Err(error) = engine.insert_dtmf(tone).await {
            warn!(
                correlation_id = %self.shared.correlation_id,
                "unable to send digit: {error}"
            );
        }
    }
}
