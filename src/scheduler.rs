//! Single-in-flight command gate with a small FIFO.
//!
//! Pure bookkeeping: the scheduler decides *what* may be sent and the session
//! does the sending, then reports back through [`Scheduler::mark_dispatched`]
//! and [`Scheduler::on_idle`]. `in_flight` is the only mutual exclusion; it is
//! set on dispatch and cleared by an observed `Idle`, or by recovery.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::protocol::FwState;

/// A command waiting for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuedCommand {
    /// Start calibration.
    Calibrate,
    /// Move to a 1-based slot.
    MoveToSlot(i32),
}

impl std::fmt::Display for QueuedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueuedCommand::Calibrate => f.write_str("CALIBRATE"),
            QueuedCommand::MoveToSlot(slot) => write!(f, "MOVE to slot {}", slot),
        }
    }
}

/// Result of admitting a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The device is free; send it now.
    DispatchNow(QueuedCommand),
    /// Held until the device is free.
    Queued {
        /// Queue length after insertion.
        depth: usize,
    },
}

/// Command gate state.
#[derive(Debug, Clone)]
pub struct Scheduler {
    queue: VecDeque<QueuedCommand>,
    capacity: usize,
    in_flight: bool,
    waiting_for_calibration: bool,
}

impl Scheduler {
    /// Empty scheduler holding at most `capacity` queued commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            in_flight: false,
            waiting_for_calibration: false,
        }
    }

    /// Admit a command.
    ///
    /// A calibration first evicts everything queued. The command is sent
    /// immediately when the device is idle (or unknown), nothing is in flight
    /// and dispatch is not suspended; a move additionally needs a known slot
    /// count. Otherwise it is queued, or rejected when the queue is full.
    pub fn enqueue(
        &mut self,
        cmd: QueuedCommand,
        state: FwState,
        total_slots: i32,
        suspended: bool,
    ) -> Result<Admission, CommandError> {
        if cmd == QueuedCommand::Calibrate && !self.queue.is_empty() {
            tracing::debug!(evicted = self.queue.len(), "Calibration evicts queued commands");
            self.queue.clear();
        }

        let ready = !suspended && state.accepts_commands() && !self.in_flight;
        if ready {
            match cmd {
                QueuedCommand::Calibrate => return Ok(Admission::DispatchNow(cmd)),
                QueuedCommand::MoveToSlot(_) if total_slots > 0 => {
                    return Ok(Admission::DispatchNow(cmd))
                }
                QueuedCommand::MoveToSlot(_) => {
                    tracing::debug!("Slot count unknown; deferring move");
                }
            }
        }

        if self.queue.len() >= self.capacity {
            tracing::warn!(
                command = %cmd,
                capacity = self.capacity,
                "Command queue full, rejecting command"
            );
            return Err(CommandError::QueueFull {
                capacity: self.capacity,
            });
        }

        self.queue.push_back(cmd);
        tracing::info!(
            command = %cmd,
            depth = self.queue.len(),
            capacity = self.capacity,
            state = ?state,
            "Device busy, command queued"
        );
        Ok(Admission::Queued {
            depth: self.queue.len(),
        })
    }

    /// Record that `cmd` has been handed to the transport.
    pub fn mark_dispatched(&mut self, cmd: QueuedCommand) {
        self.in_flight = true;
        if cmd == QueuedCommand::Calibrate {
            self.waiting_for_calibration = true;
        }
    }

    /// The device reported `Idle`.
    ///
    /// Clears `in_flight`. Returns true if this completes a calibration,
    /// i.e. the wheel now reports a slot count.
    pub fn on_idle(&mut self, total_slots: i32) -> bool {
        if self.in_flight {
            tracing::debug!("Command completed (state=Idle), clearing in-flight");
        }
        self.in_flight = false;
        if self.waiting_for_calibration && total_slots > 0 {
            self.waiting_for_calibration = false;
            return true;
        }
        false
    }

    /// Pop the queue head if it may be sent now.
    ///
    /// A queued move whose slot count is still unknown stays at the head.
    pub fn next_ready(
        &mut self,
        state: FwState,
        total_slots: i32,
        suspended: bool,
    ) -> Option<QueuedCommand> {
        if suspended || self.waiting_for_calibration {
            if !self.queue.is_empty() {
                tracing::debug!(
                    suspended,
                    waiting_for_calibration = self.waiting_for_calibration,
                    pending = self.queue.len(),
                    "Deferring queued commands"
                );
            }
            return None;
        }
        if !state.accepts_commands() || self.in_flight {
            return None;
        }

        match self.queue.front()? {
            QueuedCommand::Calibrate => self.queue.pop_front(),
            QueuedCommand::MoveToSlot(_) if total_slots > 0 => self.queue.pop_front(),
            QueuedCommand::MoveToSlot(_) => {
                tracing::debug!("Deferring queued move until slot count is known");
                None
            }
        }
    }

    /// Keep only the most recent queued move; calibrations are dropped.
    pub fn drain_for_recovery(&mut self) {
        let last_move = self
            .queue
            .iter()
            .rev()
            .find(|cmd| matches!(cmd, QueuedCommand::MoveToSlot(_)))
            .copied();
        self.queue.clear();
        self.queue.extend(last_move);
    }

    /// Replace the queue with a single interrupted move.
    pub fn reseed(&mut self, target_slot: i32) {
        self.queue.clear();
        self.queue.push_back(QueuedCommand::MoveToSlot(target_slot));
    }

    /// Stop holding the queue for a calibration that will not be observed.
    pub fn clear_calibration_wait(&mut self) {
        self.waiting_for_calibration = false;
    }

    /// Forget the in-flight command without an `Idle` observation.
    pub fn reset_in_flight(&mut self) {
        self.in_flight = false;
        self.waiting_for_calibration = false;
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.reset_in_flight();
    }

    /// A command is outstanding.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// A dispatched calibration has not completed yet.
    pub fn waiting_for_calibration(&self) -> bool {
        self.waiting_for_calibration
    }

    /// Queued commands, head first.
    pub fn queued(&self) -> Vec<QueuedCommand> {
        self.queue.iter().copied().collect()
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use QueuedCommand::{Calibrate, MoveToSlot};

    #[test]
    fn test_immediate_dispatch_when_idle() {
        let mut sched = Scheduler::new(2);
        let admission = sched.enqueue(MoveToSlot(3), FwState::Idle, 5, false).unwrap();
        assert_eq!(admission, Admission::DispatchNow(MoveToSlot(3)));
        sched.mark_dispatched(MoveToSlot(3));
        assert!(sched.in_flight());
    }

    #[test]
    fn test_queue_then_reject_when_full() {
        let mut sched = Scheduler::new(2);
        sched.mark_dispatched(MoveToSlot(1));

        assert_eq!(
            sched.enqueue(MoveToSlot(2), FwState::Moving, 5, false).unwrap(),
            Admission::Queued { depth: 1 }
        );
        assert_eq!(
            sched.enqueue(MoveToSlot(3), FwState::Moving, 5, false).unwrap(),
            Admission::Queued { depth: 2 }
        );
        assert!(matches!(
            sched.enqueue(MoveToSlot(4), FwState::Moving, 5, false),
            Err(CommandError::QueueFull { capacity: 2 })
        ));
        assert_eq!(sched.queued(), vec![MoveToSlot(2), MoveToSlot(3)]);
    }

    #[test]
    fn test_calibration_evicts_queued_moves() {
        let mut sched = Scheduler::new(2);
        sched.mark_dispatched(MoveToSlot(1));
        sched.enqueue(MoveToSlot(2), FwState::Moving, 5, false).unwrap();
        sched.enqueue(MoveToSlot(3), FwState::Moving, 5, false).unwrap();

        sched.enqueue(Calibrate, FwState::Moving, 5, false).unwrap();
        assert_eq!(sched.queued(), vec![Calibrate]);
    }

    #[test]
    fn test_move_deferred_until_slots_known() {
        let mut sched = Scheduler::new(2);
        assert_eq!(
            sched.enqueue(Calibrate, FwState::Idle, 0, false).unwrap(),
            Admission::DispatchNow(Calibrate)
        );
        sched.mark_dispatched(Calibrate);
        sched.enqueue(MoveToSlot(4), FwState::Calibrating, 0, false).unwrap();

        // Idle without a slot count: calibration not done, move stays queued
        assert!(!sched.on_idle(0));
        assert_eq!(sched.next_ready(FwState::Idle, 0, false), None);
        assert_eq!(sched.len(), 1);

        assert!(sched.on_idle(6));
        assert_eq!(sched.next_ready(FwState::Idle, 6, false), Some(MoveToSlot(4)));
        assert!(sched.is_empty());
    }

    #[test]
    fn test_suspended_never_dispatches() {
        let mut sched = Scheduler::new(2);
        assert_eq!(
            sched.enqueue(MoveToSlot(2), FwState::Idle, 5, true).unwrap(),
            Admission::Queued { depth: 1 }
        );
        assert_eq!(sched.next_ready(FwState::Idle, 5, true), None);
        assert_eq!(sched.next_ready(FwState::Idle, 5, false), Some(MoveToSlot(2)));
    }

    #[test]
    fn test_single_in_flight_over_sequence() {
        // Interleave requests and observations; count dispatches between Idles
        let mut sched = Scheduler::new(2);
        let mut outstanding = 0;
        let mut state = FwState::Idle;

        let steps: &[Option<QueuedCommand>] = &[
            Some(MoveToSlot(2)),
            Some(MoveToSlot(3)),
            Some(Calibrate),
            None,
            Some(MoveToSlot(5)),
            Some(MoveToSlot(1)),
            Some(MoveToSlot(4)),
            None,
            None,
            None,
        ];

        for step in steps {
            match step {
                Some(cmd) => {
                    if let Ok(Admission::DispatchNow(cmd)) = sched.enqueue(*cmd, state, 5, false) {
                        sched.mark_dispatched(cmd);
                        outstanding += 1;
                        state = FwState::Moving;
                    }
                }
                None => {
                    state = FwState::Idle;
                    sched.on_idle(5);
                    outstanding = 0;
                    if let Some(cmd) = sched.next_ready(state, 5, false) {
                        sched.mark_dispatched(cmd);
                        outstanding += 1;
                        state = FwState::Moving;
                    }
                }
            }
            assert!(outstanding <= 1, "two commands outstanding without an Idle");
        }
    }

    #[test]
    fn test_drain_for_recovery_keeps_last_move() {
        let mut sched = Scheduler::new(3);
        sched.mark_dispatched(MoveToSlot(1));
        sched.enqueue(MoveToSlot(2), FwState::Moving, 5, false).unwrap();
        sched.enqueue(MoveToSlot(4), FwState::Moving, 5, false).unwrap();
        sched.drain_for_recovery();
        assert_eq!(sched.queued(), vec![MoveToSlot(4)]);

        sched.enqueue(Calibrate, FwState::Moving, 5, false).unwrap();
        sched.drain_for_recovery();
        assert!(sched.is_empty());

        sched.reseed(3);
        assert_eq!(sched.queued(), vec![MoveToSlot(3)]);
    }
}
