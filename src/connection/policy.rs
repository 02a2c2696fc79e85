//! Retry decisions after a failed or lost connection

use serde::Deserialize;
use std::time::Duration;

/// Who decides whether to reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Ask the external collaborator (a UI prompt) and wait for its answer
    Ask,
    /// Retry automatically with exponential backoff
    #[default]
    Backoff,
    /// Stay failed
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    AskUser,
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub mode: ReconnectMode,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Backoff caps at this value
    pub max_delay: Duration,
    /// Consecutive failures after which retrying stops (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::Backoff,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// What to do after `failures` consecutive failures (>= 1)
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if self.max_attempts > 0 && failures >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match self.mode {
            ReconnectMode::Never => RetryDecision::GiveUp,
            ReconnectMode::Ask => RetryDecision::AskUser,
            ReconnectMode::Backoff => RetryDecision::RetryAfter(self.delay_for(failures)),
        }
    }

    /// Doubling delay starting at `initial_delay`, capped at `max_delay`
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}
