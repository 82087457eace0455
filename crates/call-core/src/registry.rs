//! Call registry and push-notification dispatch.
//!
//! The registry owns the collection of live calls, keyed by correlation id,
//! and is the single entry point for push notifications from the calling
//! service. Dispatch is synchronous: the envelope is routed to the right
//! call's channel (or a new call is admitted) without holding any lock
//! across an await point.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::call::{Call, CallMachineEvent, MediaMachineEvent, ProgressInfo, RemoveCallback};
use crate::config::EngineConfig;
use crate::events::{IncomingCallInfo, RegistryEvent};
use crate::traits::{
    CallerIdResolver, MetricsReporter, NoopCallerIdResolver, NoopMetrics, SignalingTransport,
};
use crate::types::{CallDirection, CallId, CallTarget, CorrelationId, DeviceId, LineId};
use crate::wire::{PushEnvelope, PushEventType, RoapMessageType};

/// Collection of live calls plus the push dispatcher.
pub struct CallRegistry {
    config: EngineConfig,
    transport: Arc<dyn SignalingTransport>,
    resolver: Arc<dyn CallerIdResolver>,
    metrics: Arc<dyn MetricsReporter>,
    calls: Arc<DashMap<CorrelationId, Arc<Call>>>,
    lines: DashMap<DeviceId, LineId>,
    events: broadcast::Sender<RegistryEvent>,
}

impl CallRegistry {
    pub fn new(config: EngineConfig, transport: Arc<dyn SignalingTransport>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            config,
            transport,
            resolver: Arc::new(NoopCallerIdResolver),
            metrics: Arc::new(NoopMetrics),
            calls: Arc::new(DashMap::new()),
            lines: DashMap::new(),
            events,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CallerIdResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsReporter>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Subscribe to registry-level events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Associate a device with its line, used to label calls admitted for
    /// that device.
    pub fn register_line(&self, device_id: DeviceId, line_id: LineId) {
        self.lines.insert(device_id, line_id);
    }

    /// Create an outbound call toward `destination`. The returned handle is
    /// idle until [`Call::dial`] is invoked with a media engine.
    pub fn create_call(&self, device_id: DeviceId, destination: CallTarget) -> Arc<Call> {
        self.admit(CallDirection::Outbound, device_id, Some(destination))
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<Arc<Call>> {
        self.calls
            .get(correlation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Route a push notification from the calling service.
    pub fn process_push(&self, envelope: PushEnvelope) {
        match envelope.event_type {
            PushEventType::Setup => self.on_setup(envelope),
            PushEventType::Progress => {
                let Some(call) = self.resolve(&envelope) else {
                    return;
                };
                let info = ProgressInfo {
                    inband_media: envelope
                        .call_progress_data
                        .map(|data| data.inband_media)
                        .unwrap_or(false),
                    caller_id: envelope.caller_id,
                };
                call.send_call_event(CallMachineEvent::RecvProgress(info));
            }
            PushEventType::Connected => {
                if let Some(call) = self.resolve(&envelope) {
                    call.send_call_event(CallMachineEvent::RecvConnect);
                }
            }
            PushEventType::Disconnected => {
                if let Some(call) = self.resolve(&envelope) {
                    call.send_call_event(CallMachineEvent::RecvDisconnect);
                }
            }
            PushEventType::Media => self.on_media(envelope),
            PushEventType::Unknown => {
                warn!("unrecognized push notification type, dropping");
            }
        }
    }

    fn admit(
        &self,
        direction: CallDirection,
        device_id: DeviceId,
        destination: Option<CallTarget>,
    ) -> Arc<Call> {
        let line_id = self
            .lines
            .get(&device_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let call = Call::spawn(
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.resolver),
            Arc::clone(&self.metrics),
            direction,
            device_id,
            line_id,
            destination,
            self.removal_callback(),
        );
        self.calls
            .insert(call.correlation_id().clone(), Arc::clone(&call));
        info!(
            correlation_id = %call.correlation_id(),
            %direction,
            active = self.calls.len(),
            "added call to registry"
        );
        call
    }

    fn resolve(&self, envelope: &PushEnvelope) -> Option<Arc<Call>> {
        let Some(correlation_id) = &envelope.correlation_id else {
            warn!(
                event = ?envelope.event_type,
                "push notification without correlation id, dropping"
            );
            return None;
        };
        let call = self.get(correlation_id);
        if call.is_none() {
            warn!(
                %correlation_id,
                event = ?envelope.event_type,
                "push notification for unknown call, dropping"
            );
        }
        call
    }

    fn find_by_call_id(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.calls
            .iter()
            .find(|entry| entry.value().call_id() == *call_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Setup notifications double as mid-call carriers: an envelope with a
    /// `midCallService` list updates an existing call instead of admitting
    /// a new one.
    fn on_setup(&self, envelope: PushEnvelope) {
        if let Some(entries) = envelope.mid_call_service {
            let Some(correlation_id) = envelope.correlation_id else {
                warn!("mid-call notification without correlation id, dropping");
                return;
            };
            match self.get(&correlation_id) {
                Some(call) => {
                    for entry in entries {
                        call.handle_midcall(entry);
                    }
                }
                None => warn!(
                    %correlation_id,
                    "mid-call notification for unknown call, dropping"
                ),
            }
            return;
        }

        let Some(call_id) = envelope.call_id else {
            warn!("setup notification without call id, dropping");
            return;
        };
        // A media push for this call may have been dispatched first; the
        // setup then maps onto the call it admitted and is still signaled.
        let call = match self.find_by_call_id(&call_id) {
            Some(existing) => {
                debug!(
                    correlation_id = %existing.correlation_id(),
                    %call_id,
                    "setup matched an already admitted call"
                );
                existing
            }
            None => {
                let call = self.admit(CallDirection::Inbound, envelope.device_id.clone(), None);
                call.set_call_id(call_id.clone());
                call.set_broadworks_correlation_info(envelope.broadworks_correlation_info);
                call
            }
        };
        if let Some(raw) = envelope.caller_id {
            call.start_caller_id_resolution(raw);
        }
        let _ = self.events.send(RegistryEvent::IncomingCall(IncomingCallInfo {
            correlation_id: call.correlation_id().clone(),
            call_id,
            device_id: call.device_id().clone(),
            line_id: call.line_id().clone(),
            direction: call.direction(),
            broadworks_correlation_info: call.broadworks_correlation_info(),
            received_at: Utc::now(),
        }));
        call.send_call_event(CallMachineEvent::RecvSetup);
    }

    fn on_media(&self, envelope: PushEnvelope) {
        let Some(message) = envelope.message else {
            warn!("media notification without a message, dropping");
            return;
        };
        let known = envelope
            .correlation_id
            .as_ref()
            .and_then(|id| self.get(id))
            .or_else(|| {
                envelope
                    .call_id
                    .as_ref()
                    .and_then(|id| self.find_by_call_id(id))
            });
        let call = match known {
            Some(call) => call,
            None => {
                // Media for an inbound call can outrun its setup.
                let Some(call_id) = envelope.call_id.clone() else {
                    warn!("media notification for unknown call without call id, dropping");
                    return;
                };
                debug!(%call_id, "media notification ahead of setup, admitting call");
                let call = self.admit(CallDirection::Inbound, envelope.device_id.clone(), None);
                call.set_call_id(call_id);
                call
            }
        };
        match message.message_type {
            RoapMessageType::Offer => {
                call.send_media_event(MediaMachineEvent::RecvOffer(message));
            }
            RoapMessageType::Answer => {
                call.send_media_event(MediaMachineEvent::RecvAnswer(message));
            }
            RoapMessageType::OfferRequest => {
                call.send_media_event(MediaMachineEvent::RecvOfferRequest(message));
            }
            RoapMessageType::Ok => {
                call.send_media_event(MediaMachineEvent::Ok {
                    received: true,
                    message,
                });
            }
            RoapMessageType::Error => {
                warn!(
                    correlation_id = %call.correlation_id(),
                    error_type = ?message.error_type,
                    "remote ROAP error received"
                );
            }
            RoapMessageType::OfferResponse => {
                warn!(
                    correlation_id = %call.correlation_id(),
                    "unexpected OFFER_RESPONSE from server, dropping"
                );
            }
        }
    }

    fn removal_callback(&self) -> RemoveCallback {
        let calls = Arc::clone(&self.calls);
        let events = self.events.clone();
        Arc::new(move |correlation_id: &CorrelationId| {
            if calls.remove(correlation_id).is_some() {
                let remaining = calls.len();
                info!(%correlation_id, remaining, "removed call from registry");
                if remaining == 0 {
                    let _ = events.send(RegistryEvent::AllCallsCleared);
                }
            }
        })
    }
}
