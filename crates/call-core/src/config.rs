//! Engine configuration.

use std::time::Duration;

/// Tunables for the call engine.
///
/// The defaults match the calling service's expectations; most deployments
/// only ever override the event channel capacity.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long to wait for the server's mid-call confirmation after a
    /// hold or resume request succeeds.
    pub supplementary_timeout: Duration,
    /// Interval between session-refresh status posts on an established call.
    pub session_refresh_interval: Duration,
    /// Prefix for locally minted call ids used before the server assigns one.
    pub local_call_id_prefix: String,
    /// Capacity of the per-call and registry broadcast event channels.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supplementary_timeout: Duration::from_secs(10),
            session_refresh_interval: Duration::from_secs(20 * 60),
            local_call_id_prefix: "local-call".to_string(),
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_supplementary_timeout(mut self, timeout: Duration) -> Self {
        self.supplementary_timeout = timeout;
        self
    }

    pub fn with_session_refresh_interval(mut self, interval: Duration) -> Self {
        self.session_refresh_interval = interval;
        self
    }

    pub fn with_local_call_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.local_call_id_prefix = prefix.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
