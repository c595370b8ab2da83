//! Link recovery state machine.
//!
//! ```text
//! None ──failure──▶ InProgress ──reconnected, Calibrating──▶ WaitCalibration
//!                        │                                        │
//!                        └──reconnected, Idle with slots──▶ None ◀┘ Idle with slots
//!
//! InProgress / WaitCalibration ──timeout──▶ None (device failed)
//! ```
//!
//! This type only tracks state and time; the session performs the reconnect.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::FwState;
use crate::transport::StateReport;

/// Where recovery stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    /// Link healthy.
    None,
    /// Reopening the port and renegotiating.
    InProgress,
    /// Link restored; firmware is auto-calibrating.
    WaitCalibration,
}

/// Next step after a state read during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Device is ready again.
    Complete,
    /// Keep waiting for calibration to finish.
    Waiting,
}

/// Recovery tracker.
#[derive(Debug, Clone)]
pub struct Recovery {
    state: RecoveryState,
    started: Option<Instant>,
    timeout: Duration,
}

impl Recovery {
    /// Idle tracker that gives up `timeout` after starting.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: RecoveryState::None,
            started: None,
            timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Recovery is running.
    pub fn is_active(&self) -> bool {
        self.state != RecoveryState::None
    }

    /// Enter `InProgress`. Returns false if recovery was already running.
    pub fn begin(&mut self, now: Instant) -> bool {
        if self.is_active() {
            return false;
        }
        self.state = RecoveryState::InProgress;
        self.started = Some(now);
        true
    }

    /// Instant at which recovery gives up.
    pub fn deadline(&self) -> Option<Instant> {
        self.started.map(|s| s + self.timeout)
    }

    /// The timeout has elapsed.
    pub fn timed_out(&self, now: Instant) -> bool {
        self.is_active() && self.deadline().is_some_and(|d| now >= d)
    }

    /// Time spent recovering so far.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default()
    }

    /// First state read after the port was reopened and renegotiated.
    pub fn on_reconnected(&mut self, report: &StateReport) -> RecoveryStep {
        if is_ready(report) {
            return RecoveryStep::Complete;
        }
        if report.state != FwState::Calibrating {
            tracing::debug!(state = ?report.state, "Reconnected in unexpected state, waiting for calibration");
        }
        self.state = RecoveryState::WaitCalibration;
        RecoveryStep::Waiting
    }

    /// State read while waiting for calibration.
    pub fn on_wait_report(&mut self, report: &StateReport) -> RecoveryStep {
        if is_ready(report) {
            RecoveryStep::Complete
        } else {
            RecoveryStep::Waiting
        }
    }

    /// Communication failed while waiting; go back to reconnecting.
    pub fn on_wait_failure(&mut self) {
        if self.state == RecoveryState::WaitCalibration {
            self.state = RecoveryState::InProgress;
        }
    }

    /// Return to `None` (success or giving up).
    pub fn reset(&mut self) {
        self.state = RecoveryState::None;
        self.started = None;
    }
}

fn is_ready(report: &StateReport) -> bool {
    report.state == FwState::Idle && report.slots > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: FwState, slots: i32) -> StateReport {
        StateReport {
            state,
            fw_pos: 0,
            slots,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_boundary() {
        let mut recovery = Recovery::new(Duration::from_secs(60));
        let start = Instant::now();
        assert!(recovery.begin(start));
        assert!(!recovery.begin(start));

        assert!(!recovery.timed_out(start + Duration::from_millis(59_999)));
        assert!(recovery.timed_out(start + Duration::from_secs(60)));
        assert_eq!(recovery.deadline(), Some(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_transitions() {
        let mut recovery = Recovery::new(Duration::from_secs(60));
        recovery.begin(Instant::now());

        assert_eq!(
            recovery.on_reconnected(&report(FwState::Calibrating, 5)),
            RecoveryStep::Waiting
        );
        assert_eq!(recovery.state(), RecoveryState::WaitCalibration);

        assert_eq!(
            recovery.on_wait_report(&report(FwState::Calibrating, 5)),
            RecoveryStep::Waiting
        );
        assert_eq!(
            recovery.on_wait_report(&report(FwState::Idle, 0)),
            RecoveryStep::Waiting
        );
        assert_eq!(
            recovery.on_wait_report(&report(FwState::Idle, 6)),
            RecoveryStep::Complete
        );

        recovery.on_wait_failure();
        assert_eq!(recovery.state(), RecoveryState::InProgress);
        assert_eq!(
            recovery.on_reconnected(&report(FwState::Idle, 6)),
            RecoveryStep::Complete
        );

        recovery.reset();
        assert!(!recovery.is_active());
    }
}
