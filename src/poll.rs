//! Poll cadence and communication health.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PollConfig;
use crate::protocol::FwState;

/// Next poll delay outside recovery.
///
/// Backoff wins over everything; otherwise busy devices are polled faster.
pub fn poll_delay(config: &PollConfig, backoff: bool, state: FwState) -> Duration {
    if backoff {
        config.backoff
    } else if state.is_busy() {
        config.active
    } else {
        config.idle
    }
}

/// Link health as shown to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkHealth {
    /// Last poll succeeded.
    Ok,
    /// Recent poll failures; polling slowed down.
    Backoff,
    /// Reconnect in progress; position is not trustworthy.
    Recovering,
    /// Recovery timed out; a fresh connect is required.
    Failed,
}

/// What a poll failure leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Backoff is now active.
    pub backoff: bool,
    /// The failure threshold was reached; start recovery.
    pub recover: bool,
}

/// Consecutive-failure counter with adaptive backoff.
#[derive(Debug, Clone, Default)]
pub struct CommHealth {
    consecutive_failures: u32,
    backoff: bool,
}

impl CommHealth {
    /// A poll succeeded; clears backoff.
    pub fn on_success(&mut self) {
        if self.backoff || self.consecutive_failures > 0 {
            tracing::debug!(
                failures = self.consecutive_failures,
                "Communication restored, clearing backoff"
            );
        }
        self.consecutive_failures = 0;
        self.backoff = false;
    }

    /// A poll failed without a link-level error.
    pub fn on_failure(&mut self, backoff_after: u32, recovery_threshold: u32) -> FailureOutcome {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= backoff_after {
            self.backoff = true;
        }
        let recover = self.consecutive_failures >= recovery_threshold;
        if recover {
            self.consecutive_failures = 0;
        }
        FailureOutcome {
            backoff: self.backoff,
            recover,
        }
    }

    /// Forget failures and backoff.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.backoff = false;
    }

    /// Backoff is active.
    pub fn backoff(&self) -> bool {
        self.backoff
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
