use crate::config::RestartSettings;
use std::time::Duration;

/// Outcome of an unexpected exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    GiveUp,
}

/// Bounded-retry restart policy
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Automatic restarts allowed since the last explicit start
    pub max_restarts: u32,
    /// Quota seconds charged per automatic restart
    pub penalty_secs: u64,
    /// Delay before each automatic restart (in seconds)
    pub backoff_secs: u64,
}

impl RestartPolicy {
    /// Create a new restart policy with default values
    pub fn new() -> Self {
        Self::from_settings(&RestartSettings::default())
    }

    pub fn from_settings(settings: &RestartSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            penalty_secs: settings.penalty_secs,
            backoff_secs: settings.backoff_secs,
        }
    }

    /// Restart while fewer than `max_restarts` automatic restarts have happened
    pub fn decide(&self, restart_count: u32) -> RestartDecision {
        if restart_count < self.max_restarts {
            RestartDecision::Restart
        } else {
            RestartDecision::GiveUp
        }
    }

    /// Remaining quota after charging one restart
    pub fn charge(&self, remaining_secs: u64) -> u64 {
        remaining_secs.saturating_sub(self.penalty_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new()
    }
}
