//! Last-observed device state.

use serde::Serialize;

use crate::protocol::FwState;
use crate::slots::{clamp_slot_count, fw_pos_to_ui, FilterNames};
use crate::transport::StateReport;

/// The session's single view of the device.
///
/// Only the session writes to it, and only from a state read or a dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceState {
    /// Firmware state from the most recent successful read.
    pub fw_state: FwState,
    /// Slot count, clamped to `[1, 16]` once known; `0` until then.
    pub total_slots: i32,
    /// 1-based slot from the most recent read; `0` while unknown.
    pub current_slot: i32,
    /// Sticky last valid slot; never overwritten by an unknown reading.
    pub last_known_slot: i32,
    /// Pending move target; `0` when none.
    pub target_slot: i32,
    /// Per-slot labels.
    pub names: FilterNames,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            fw_state: FwState::Unknown,
            total_slots: 0,
            current_slot: 0,
            last_known_slot: 0,
            target_slot: 0,
            names: FilterNames::default(),
        }
    }
}

/// What changed when a report was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// `(old, new)` slot count, if it changed.
    pub slots_changed: Option<(i32, i32)>,
    /// Slot reported by this read, if known.
    pub slot: Option<i32>,
}

impl DeviceState {
    /// Fold a state read into the cache.
    pub fn apply(&mut self, report: &StateReport) -> Applied {
        self.fw_state = report.state;

        let slots_changed = self.update_slot_bounds(report.slots);
        let slot = fw_pos_to_ui(report.fw_pos, self.total_slots);
        self.current_slot = slot.unwrap_or(0);
        if let Some(slot) = slot {
            self.last_known_slot = slot;
        }

        Applied {
            slots_changed,
            slot,
        }
    }

    /// Adopt a reported slot count.
    ///
    /// Non-positive reports are ignored. Returns `(old, new)` when the
    /// clamped count differs from the cached one; filter names are resized
    /// to match.
    pub fn update_slot_bounds(&mut self, reported: i32) -> Option<(i32, i32)> {
        if reported <= 0 {
            return None;
        }
        let clamped = clamp_slot_count(reported);
        if clamped != reported {
            tracing::warn!(reported, clamped, "Slot count out of range, clamping");
        }
        if clamped == self.total_slots {
            return None;
        }

        let old = self.total_slots;
        self.total_slots = clamped;
        self.names.resize(clamped as usize);
        if self.last_known_slot > clamped {
            self.last_known_slot = 0;
        }
        if self.current_slot > clamped {
            self.current_slot = 0;
        }
        tracing::info!(old, new = clamped, "Slot count updated");
        Some((old, clamped))
    }

    /// The position shown to callers is not trustworthy.
    pub fn invalidate_position(&mut self) {
        self.current_slot = 0;
        self.fw_state = FwState::Unknown;
    }
}
