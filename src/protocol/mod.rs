//! Wire vocabulary shared by all three protocol variants.
//!
//! - [`frame`]: the `Framed` codec (magic, length, payload, XOR CRC)
//! - [`Request`]: the typed command set, mapped to opcodes for the binary
//!   variants and to command lines for the text variant

pub mod frame;

use serde::{Deserialize, Serialize};

/// Position get/set. Value `-1` means get (legacy) or calibrate (framed).
pub const OP_POSITION: u32 = 0x1001;
/// Slot count get.
pub const OP_SLOTS: u32 = 0x1002;
/// Packed `{state, pos, slots}` get.
pub const OP_STATE: u32 = 0x1003;

/// Firmware position sentinel for "moving / unknown".
pub const POS_UNKNOWN: u8 = 0xFF;

/// Wire protocol variant, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Proto {
    /// Not negotiated yet.
    Unknown,
    /// Length-prefixed frames with XOR CRC.
    Framed,
    /// Fixed 8-byte `{cmd, value}` structs, no checksum.
    Legacy,
    /// CRLF-terminated command lines.
    Text,
}

impl Proto {
    /// Short lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Unknown => "unknown",
            Proto::Framed => "framed",
            Proto::Legacy => "legacy",
            Proto::Text => "text",
        }
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firmware state as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FwState {
    /// Ready for a command.
    Idle,
    /// Wheel in motion.
    Moving,
    /// Homing / counting slots.
    Calibrating,
    /// Firmware-reported fault.
    Error,
    /// Nothing observed yet, or an unrecognized code.
    Unknown,
}

impl FwState {
    /// Decode the firmware state byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => FwState::Idle,
            1 => FwState::Calibrating,
            2 => FwState::Moving,
            3 => FwState::Error,
            _ => FwState::Unknown,
        }
    }

    /// Firmware state byte.
    pub fn code(self) -> u8 {
        match self {
            FwState::Idle => 0,
            FwState::Calibrating => 1,
            FwState::Moving => 2,
            FwState::Error => 3,
            FwState::Unknown => 0xFF,
        }
    }

    /// Moving or calibrating.
    pub fn is_busy(self) -> bool {
        matches!(self, FwState::Moving | FwState::Calibrating)
    }

    /// Idle or not yet known; commands may be dispatched.
    pub fn accepts_commands(self) -> bool {
        matches!(self, FwState::Idle | FwState::Unknown)
    }
}

/// A command understood by every protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Read the 0-based position.
    GetPosition,
    /// Move to a 0-based position.
    SetPosition(u8),
    /// Start calibration.
    Calibrate,
    /// Read the slot count.
    GetSlots,
    /// Read the packed state (framed) or the state code (text).
    GetState,
}

impl Request {
    /// `(cmd, value)` pair for the binary variants.
    pub fn opcode(self) -> (u32, i32) {
        match self {
            Request::GetPosition | Request::Calibrate => (OP_POSITION, -1),
            Request::SetPosition(pos) => (OP_POSITION, i32::from(pos)),
            Request::GetSlots => (OP_SLOTS, 0),
            Request::GetState => (OP_STATE, 0),
        }
    }

    /// Command line for the text variant, without terminator.
    pub fn text_line(self) -> String {
        match self {
            Request::GetPosition => "POS".to_string(),
            Request::SetPosition(pos) => format!("POS {}", pos),
            Request::Calibrate => "CALIBRATE".to_string(),
            Request::GetSlots => "SLOTS".to_string(),
            Request::GetState => "STATUS".to_string(),
        }
    }

    /// Reads return data; commands only acknowledge.
    pub fn is_query(self) -> bool {
        matches!(
            self,
            Request::GetPosition | Request::GetSlots | Request::GetState
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        for state in [
            FwState::Idle,
            FwState::Moving,
            FwState::Calibrating,
            FwState::Error,
        ] {
            assert_eq!(FwState::from_code(state.code()), state);
        }
        assert_eq!(FwState::from_code(7), FwState::Unknown);
    }

    #[test]
    fn test_firmware_state_table() {
        assert_eq!(FwState::from_code(0), FwState::Idle);
        assert_eq!(FwState::from_code(1), FwState::Calibrating);
        assert_eq!(FwState::from_code(2), FwState::Moving);
        assert_eq!(FwState::from_code(3), FwState::Error);
        assert_eq!(FwState::from_code(0xFF), FwState::Unknown);
        assert_eq!(FwState::Calibrating.code(), 1);
        assert_eq!(FwState::Moving.code(), 2);
    }

    #[test]
    fn test_request_mapping() {
        assert_eq!(Request::SetPosition(2).opcode(), (0x1001, 2));
        assert_eq!(Request::Calibrate.opcode(), (0x1001, -1));
        assert_eq!(Request::GetSlots.opcode(), (0x1002, 0));
        assert_eq!(Request::GetState.opcode(), (0x1003, 0));

        assert_eq!(Request::SetPosition(4).text_line(), "POS 4");
        assert_eq!(Request::GetState.text_line(), "STATUS");
        assert!(!Request::Calibrate.is_query());
    }
}
