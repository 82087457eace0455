//! ROAP sequence bookkeeping.
//!
//! Tracks the local sequence counter, the highest acknowledged OK, and the
//! single-slot buffer for remote messages that cannot be applied yet. The
//! sequencer is pure state; the call task decides what to do with each
//! [`RemoteDecision`].

use tracing::warn;

use crate::wire::RoapMessage;

/// What to do with a remote offer or offer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDecision {
    /// No media engine is attached yet; buffer and adopt the sequence.
    BufferUninitialized,
    /// The previous negotiation round has not been acknowledged; the remote
    /// message is one round ahead. Buffer it for replay after the OK.
    BufferAhead,
    /// The message can be applied to the media engine now.
    Apply,
}

/// Per-call ROAP sequence state.
#[derive(Debug)]
pub struct Sequencer {
    local_seq: u32,
    received_ok_seq: u32,
    buffered: Option<RoapMessage>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            local_seq: 1,
            received_ok_seq: 0,
            buffered: None,
        }
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn received_ok_seq(&self) -> u32 {
        self.received_ok_seq
    }

    /// Classify a remote offer or offer request by its sequence number.
    pub fn classify_remote(&self, seq: u32, engine_ready: bool) -> RemoteDecision {
        if !engine_ready {
            RemoteDecision::BufferUninitialized
        } else if seq >= 2 && self.received_ok_seq == seq - 2 {
            RemoteDecision::BufferAhead
        } else {
            RemoteDecision::Apply
        }
    }

    /// Adopt a remote sequence number. The counter never moves backwards.
    pub fn adopt(&mut self, seq: u32) {
        self.local_seq = self.local_seq.max(seq);
    }

    /// Advance to the next negotiation round and return its sequence number.
    pub fn next_round(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Record an acknowledged OK. The counter never moves backwards.
    pub fn record_ok(&mut self, seq: u32) {
        self.received_ok_seq = self.received_ok_seq.max(seq);
    }

    /// Store a remote message in the single buffer slot.
    ///
    /// The slot holds one message; a second glare'd message with a different
    /// sequence number replaces the first. Known limitation, kept as is.
    pub fn buffer(&mut self, message: RoapMessage) {
        if let Some(existing) = &self.buffered {
            if existing.seq != message.seq {
                warn!(
                    dropped_seq = existing.seq,
                    new_seq = message.seq,
                    "overwriting buffered remote media message"
                );
            }
        }
        self.buffered = Some(message);
    }

    pub fn buffered(&self) -> Option<&RoapMessage> {
        self.buffered.as_ref()
    }

    /// A buffered message from a round ahead of the local counter, if any.
    /// The slot is left in place; replay re-buffers as a side effect.
    pub fn buffered_ahead(&self) -> Option<RoapMessage> {
        self.buffered
            .as_ref()
            .filter(|m| m.seq > self.local_seq)
            .cloned()
    }
}
