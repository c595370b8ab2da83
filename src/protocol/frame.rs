//! Framed wire codec.
//!
//! ```text
//! MAGIC(0xA5) | LEN | PAYLOAD(LEN) | CRC
//! ```
//!
//! `CRC` is the XOR of every preceding byte. Two payload sizes are legal:
//!
//! | LEN | payload                                          | total |
//! |-----|--------------------------------------------------|-------|
//! | 8   | `cmd: u32 LE`, `value: i32 LE`                   | 11    |
//! | 12  | `cmd: u32 LE`, `state, pos, slots, 0`, reserved  | 15    |
//!
//! The firmware prints human-readable debug lines on the same wire, so the
//! decoder treats anything before a magic byte as noise and, after a bad
//! length or CRC, drops the candidate frame and keeps hunting.

use bytes::{Buf, BytesMut};

use crate::error::FrameError;

/// Frame start marker.
pub const MAGIC: u8 = 0xA5;
/// Total size of a command/value frame.
pub const VALUE_FRAME_LEN: usize = 11;
/// Total size of a packed state frame.
pub const STATE_FRAME_LEN: usize = 15;
/// Default noise budget before a sync attempt is reported as failed.
pub const DEFAULT_SCAN_WINDOW: usize = 512;

const HEADER_LEN: usize = 2;

/// XOR of all bytes.
pub fn xor_crc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Encode a command/value request. Always 11 bytes.
pub fn encode(cmd: u32, value: i32) -> [u8; VALUE_FRAME_LEN] {
    let mut frame = [0u8; VALUE_FRAME_LEN];
    frame[0] = MAGIC;
    frame[1] = 8;
    frame[2..6].copy_from_slice(&cmd.to_le_bytes());
    frame[6..10].copy_from_slice(&value.to_le_bytes());
    frame[10] = xor_crc(&frame[..10]);
    frame
}

/// Encode a packed state reply. Always 15 bytes.
pub fn encode_state(cmd: u32, state: u8, pos: u8, slots: u8) -> [u8; STATE_FRAME_LEN] {
    let mut frame = [0u8; STATE_FRAME_LEN];
    frame[0] = MAGIC;
    frame[1] = 12;
    frame[2..6].copy_from_slice(&cmd.to_le_bytes());
    frame[6] = state;
    frame[7] = pos;
    frame[8] = slots;
    frame[14] = xor_crc(&frame[..14]);
    frame
}

/// A frame that passed length and CRC checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedFrame {
    /// 8-byte payload.
    Value {
        /// Echoed opcode.
        cmd: u32,
        /// Reply value.
        value: i32,
    },
    /// 12-byte payload.
    State {
        /// Echoed opcode.
        cmd: u32,
        /// Firmware state code.
        state: u8,
        /// 0-based position or `0xFF`.
        pos: u8,
        /// Slot count.
        slots: u8,
    },
}

impl DecodedFrame {
    /// Echoed opcode.
    pub fn cmd(&self) -> u32 {
        match *self {
            DecodedFrame::Value { cmd, .. } | DecodedFrame::State { cmd, .. } => cmd,
        }
    }

    /// Reply as a 32-bit value; state frames pack `state | pos << 8 | slots << 16`.
    pub fn value(&self) -> i32 {
        match *self {
            DecodedFrame::Value { value, .. } => value,
            DecodedFrame::State {
                state, pos, slots, ..
            } => i32::from(state) | (i32::from(pos) << 8) | (i32::from(slots) << 16),
        }
    }

    fn parse(frame: &[u8]) -> Self {
        let cmd = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
        if frame.len() == STATE_FRAME_LEN {
            DecodedFrame::State {
                cmd,
                state: frame[6],
                pos: frame[7],
                slots: frame[8],
            }
        } else {
            DecodedFrame::Value {
                cmd,
                value: i32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]),
            }
        }
    }
}

/// Incremental frame hunter over a receive buffer.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    scan_window: usize,
    scanned: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_WINDOW)
    }
}

impl FrameDecoder {
    /// Decoder that reports [`FrameError::NoSync`] after `scan_window` noise bytes.
    pub fn new(scan_window: usize) -> Self {
        Self {
            scan_window,
            scanned: 0,
        }
    }

    /// Try to take one frame off the front of `buf`.
    ///
    /// - `None`: more input is needed.
    /// - `Some(Err(_))`: a candidate was rejected and dropped; call again.
    /// - `Some(Ok(_))`: a frame was consumed.
    pub fn step(&mut self, buf: &mut BytesMut) -> Option<Result<DecodedFrame, FrameError>> {
        match buf.iter().position(|&b| b == MAGIC) {
            Some(0) => {}
            Some(pos) => {
                buf.advance(pos);
                self.scanned += pos;
            }
            None => {
                self.scanned += buf.len();
                buf.clear();
            }
        }

        if self.scanned > self.scan_window {
            let scanned = std::mem::take(&mut self.scanned);
            return Some(Err(FrameError::NoSync { scanned }));
        }

        if buf.len() < HEADER_LEN {
            return None;
        }

        let len = buf[1];
        let total = HEADER_LEN + usize::from(len) + 1;
        if total != VALUE_FRAME_LEN && total != STATE_FRAME_LEN {
            // Drop the magic byte only; the length byte may start the real frame.
            buf.advance(1);
            self.scanned = 0;
            return Some(Err(FrameError::BadLength { len, total }));
        }

        if buf.len() < total {
            return None;
        }

        let frame = buf.split_to(total);
        self.scanned = 0;

        let expected = xor_crc(&frame[..total - 1]);
        let actual = frame[total - 1];
        if expected != actual {
            return Some(Err(FrameError::CrcMismatch { expected, actual }));
        }

        Some(Ok(DecodedFrame::parse(&frame)))
    }

    /// Bytes still needed for the frame at the front of `buf`, if one has started.
    pub fn pending(buf: &BytesMut) -> Option<usize> {
        match buf.first() {
            Some(&MAGIC) if buf.len() >= HEADER_LEN => {
                Some(HEADER_LEN + usize::from(buf[1]) + 1)
            }
            Some(&MAGIC) => Some(HEADER_LEN),
            _ => None,
        }
    }
}

/// Decode the first valid frame in a complete byte sequence.
///
/// Noise and rejected candidates are skipped. If no valid frame is found the
/// last rejection is returned.
pub fn decode(bytes: &[u8]) -> Result<DecodedFrame, FrameError> {
    let mut buf = BytesMut::from(bytes);
    let mut decoder = FrameDecoder::new(usize::MAX);
    let mut last_err = None;

    while let Some(result) = decoder.step(&mut buf) {
        match result {
            Ok(frame) => return Ok(frame),
            Err(e) => last_err = Some(e),
        }
    }

    if let Some(needed) = FrameDecoder::pending(&buf) {
        return Err(FrameError::Incomplete {
            needed,
            available: buf.len(),
        });
    }
    Err(last_err.unwrap_or(FrameError::NoSync {
        scanned: bytes.len(),
    }))
}
