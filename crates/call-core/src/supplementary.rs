//! Supplementary services: hold, resume and transfer.
//!
//! Hold and resume are two-phase. The request is posted from inside the
//! call task, but success only means the server accepted it; the actual
//! state change is confirmed later by a mid-call notification, which the
//! registry routes here directly rather than through the task queue. A
//! confirmation timer bridges the gap: if no mid-call confirmation arrives
//! within the configured window, the pending operation is reported failed.
//!
//! Transfers are single-shot requests with no confirmation phase.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{info, warn};

use crate::call::{Call, CallEngine, CallMachineEvent, CallShared};
use crate::error::FailureKind;
use crate::events::{CallErrorInfo, CallEvent};
use crate::retry::surface;
use crate::traits::MetricKind;
use crate::types::{CallId, SupplementaryService, TransferType};
use crate::wire::{MidCallEntry, MidCallState, SupplementaryRequest};

impl CallEngine {
    /// Post a hold request. On acceptance, arm the confirmation timer;
    /// the call stays in the hold-pending state until the mid-call
    /// notification or the timer resolves it.
    pub(crate) async fn on_initiate_hold(&mut self) {
        let request =
            SupplementaryRequest::hold_resume(self.shared.device(), self.shared.call_id());
        match self.shared.transport.post_supplementary(&request).await {
            Ok(()) => {
                info!(
                    correlation_id = %self.shared.correlation_id,
                    "hold accepted, awaiting confirmation"
                );
                if !self.shared.is_held() {
                    arm_confirmation_timer(&self.shared, SupplementaryService::Hold);
                }
            }
            Err(error) => {
                warn!(
                    correlation_id = %self.shared.correlation_id,
                    "failed to put the call on hold: {error}"
                );
                let (kind, message) = surface(&error);
                self.surface_in_context(kind, message);
            }
        }
    }

    pub(crate) async fn on_initiate_resume(&mut self) {
        let request =
            SupplementaryRequest::hold_resume(self.shared.device(), self.shared.call_id());
        match self.shared.transport.post_supplementary(&request).await {
            Ok(()) => {
                info!(
                    correlation_id = %self.shared.correlation_id,
                    "resume accepted, awaiting confirmation"
                );
                if self.shared.is_held() {
                    arm_confirmation_timer(&self.shared, SupplementaryService::Resume);
                }
            }
            Err(error) => {
                warn!(
                    correlation_id = %self.shared.correlation_id,
                    "failed to resume the call: {error}"
                );
                let (kind, message) = surface(&error);
                self.surface_in_context(kind, message);
            }
        }
    }
}

/// Arm the hold/resume confirmation timer, replacing any previous one.
fn arm_confirmation_timer(shared: &Arc<CallShared>, service: SupplementaryService) {
    let timeout = shared.config.supplementary_timeout;
    let owner = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        warn!(
            correlation_id = %owner.correlation_id,
            %service,
            "confirmation timed out"
        );
        owner.record_metric(MetricKind::CallError, "timeout");
        let error = CallErrorInfo::new(
            FailureKind::Timeout,
            format!("The {service} request was not confirmed by the server."),
        );
        let event = match service {
            SupplementaryService::Resume => CallEvent::ResumeError {
                correlation_id: owner.correlation_id.clone(),
                error,
            },
            _ => CallEvent::HoldError {
                correlation_id: owner.correlation_id.clone(),
                error,
            },
        };
        owner.emit(event);
    });
    if let Some(previous) = shared.supplementary_timer.lock().replace(handle) {
        previous.abort();
    }
}

impl Call {
    /// Apply a mid-call notification.
    ///
    /// Runs on the registry's dispatch path, outside the call task queue,
    /// so a confirmation can land while the task is busy with another
    /// request.
    pub(crate) fn handle_midcall(&self, entry: MidCallEntry) {
        match entry {
            MidCallEntry::CallInfo { caller_id } => {
                self.start_caller_id_resolution(caller_id);
            }
            MidCallEntry::CallState { call_state } => match call_state {
                MidCallState::Held => {
                    info!(
                        correlation_id = %self.shared.correlation_id,
                        "server confirmed hold"
                    );
                    self.shared.held.store(true, Ordering::SeqCst);
                    self.shared.cancel_supplementary_timer();
                    self.shared.record_metric(MetricKind::Supplementary, "hold");
                    self.shared.emit(CallEvent::Held {
                        correlation_id: self.shared.correlation_id.clone(),
                    });
                    self.send_call_event(CallMachineEvent::Established);
                }
                MidCallState::Connected => {
                    info!(
                        correlation_id = %self.shared.correlation_id,
                        "server confirmed resume"
                    );
                    self.shared.held.store(false, Ordering::SeqCst);
                    self.shared.cancel_supplementary_timer();
                    self.shared.record_metric(MetricKind::Supplementary, "resume");
                    self.shared.emit(CallEvent::Resumed {
                        correlation_id: self.shared.correlation_id.clone(),
                    });
                    self.send_call_event(CallMachineEvent::Established);
                }
            },
        }
    }

    /// Complete a transfer of this call.
    ///
    /// Blind transfers need a destination address; consult transfers need
    /// the call id of the consultation leg. Requests missing their context
    /// are dropped with a warning and no network traffic.
    pub async fn complete_transfer(
        &self,
        transfer_type: TransferType,
        transfer_call_id: Option<CallId>,
        transfer_target: Option<String>,
    ) {
        let request = match (transfer_type, transfer_call_id, transfer_target) {
            (TransferType::Blind, _, Some(target)) => {
                SupplementaryRequest::blind_transfer(self.shared.device(), self.call_id(), target)
            }
            (TransferType::Consult, Some(consult_id), _) => SupplementaryRequest::consult_transfer(
                self.shared.device(),
                self.call_id(),
                consult_id,
            ),
            (kind, _, _) => {
                warn!(
                    correlation_id = %self.shared.correlation_id,
                    ?kind,
                    "transfer request missing required context, ignoring"
                );
                return;
            }
        };
        info!(
            correlation_id = %self.shared.correlation_id,
            ?transfer_type,
            "initiating transfer"
        );
        match self.shared.transport.post_supplementary(&request).await {
            Ok(()) => {
                let label = match transfer_type {
                    TransferType::Blind => "blind-transfer",
                    TransferType::Consult => "consult-transfer",
                };
                self.shared.record_metric(MetricKind::Supplementary, label);
            }
            Err(error) => {
                warn!(
                    correlation_id = %self.shared.correlation_id,
                    "transfer failed: {error}"
                );
                let (kind, message) = surface(&error);
                self.shared.record_metric(MetricKind::CallError, kind.to_string());
                self.shared.emit(CallEvent::TransferError {
                    correlation_id: self.shared.correlation_id.clone(),
                    error: CallErrorInfo::new(kind, message),
                });
            }
        }
    }
}
