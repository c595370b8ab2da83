//! Slot numbering and filter names.
//!
//! The firmware counts positions from 0 and reports `0xFF` while moving; hosts
//! count slots from 1. Slot counts are clamped to `[1, 16]` since a corrupted
//! read on the legacy wire can report anything.

use serde::{Deserialize, Serialize};

use crate::protocol::POS_UNKNOWN;

/// Smallest accepted slot count.
pub const MIN_SLOTS: i32 = 1;
/// Largest accepted slot count.
pub const MAX_SLOTS: i32 = 16;
/// Names synthesized before the wheel has reported a slot count.
pub const DEFAULT_NAME_COUNT: usize = 8;

/// Firmware 0-based position to 1-based slot.
///
/// `None` for the `0xFF` sentinel, negative positions, unknown slot counts,
/// and positions past the last slot.
pub fn fw_pos_to_ui(fw_pos: i32, slots: i32) -> Option<i32> {
    if fw_pos == i32::from(POS_UNKNOWN) || fw_pos < 0 || slots <= 0 || fw_pos >= slots {
        return None;
    }
    Some(fw_pos + 1)
}

/// 1-based slot to firmware 0-based position.
///
/// `None` for `ui_pos <= 0`; slot 0 means "calibrate", never a position.
pub fn ui_pos_to_fw(ui_pos: i32) -> Option<u8> {
    if ui_pos <= 0 {
        return None;
    }
    u8::try_from(ui_pos - 1).ok().filter(|&p| p != POS_UNKNOWN)
}

/// Clamp a reported slot count to `[1, 16]`.
pub fn clamp_slot_count(total: i32) -> i32 {
    total.clamp(MIN_SLOTS, MAX_SLOTS)
}

/// Clamp a requested slot into `[1, total]`.
///
/// Returns the clamped slot and whether clamping changed it.
pub fn clamp_slot(requested: i32, total: i32) -> (i32, bool) {
    let clamped = requested.clamp(1, total.max(1));
    (clamped, clamped != requested)
}

/// Per-slot labels.
///
/// Resizing keeps existing names by index and synthesizes `Filter N` for new
/// slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterNames {
    names: Vec<String>,
}

impl Default for FilterNames {
    fn default() -> Self {
        Self::with_len(DEFAULT_NAME_COUNT)
    }
}

impl FilterNames {
    /// `Filter 1` .. `Filter len`.
    pub fn with_len(len: usize) -> Self {
        Self {
            names: (1..=len).map(default_name).collect(),
        }
    }

    /// Number of names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// No names at all.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name for a 1-based slot.
    pub fn get(&self, slot: i32) -> Option<&str> {
        let index = usize::try_from(slot).ok()?.checked_sub(1)?;
        self.names.get(index).map(String::as_str)
    }

    /// Rename a 1-based slot. Returns false if the slot does not exist.
    pub fn set(&mut self, slot: i32, name: impl Into<String>) -> bool {
        let Some(index) = usize::try_from(slot).ok().and_then(|s| s.checked_sub(1)) else {
            return false;
        };
        match self.names.get_mut(index) {
            Some(existing) => {
                *existing = name.into();
                true
            }
            None => false,
        }
    }

    /// Resize to `len` entries.
    pub fn resize(&mut self, len: usize) {
        if len < self.names.len() {
            self.names.truncate(len);
        } else {
            let start = self.names.len() + 1;
            self.names.extend((start..=len).map(default_name));
        }
    }

    /// All names in slot order.
    pub fn as_slice(&self) -> &[String] {
        &self.names
    }
}

fn default_name(slot: usize) -> String {
    format!("Filter {}", slot)
}
