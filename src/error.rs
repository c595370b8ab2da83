//! Error taxonomy for the wheel link.
//!
//! Errors are layered the same way the link is:
//!
//! - **`FrameError`**: a single bad frame on the `Framed` wire. The codec's resync
//!   loop recovers from these locally; they only escape as [`FrameError::Timeout`]
//!   once the overall decode deadline has elapsed.
//! - **`TransportError`**: an adapter exchange failed. [`TransportError::is_link_failure`]
//!   splits these into link-level failures (the port is gone, recovery must run) and
//!   ordinary failures (timeouts, garbage replies) that feed the poll backoff.
//! - **`ConnectError`**: session establishment failed. Fatal; no degraded session.
//! - **`CommandError`**: what `request_slot` reports back to the host.

use std::io;

use thiserror::Error;

use crate::protocol::Proto;

// Linux errno values reported by USB-serial adapters that have been unplugged.
const EIO: i32 = 5;
const ENXIO: i32 = 6;
const ENODEV: i32 = 19;

// =============================================================================
// Frame Errors
// =============================================================================

/// A rejected frame on the `Framed` wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The length byte does not describe one of the two legal frame sizes.
    #[error("illegal frame length byte {len} (frame would be {total} bytes)")]
    BadLength {
        /// Raw length byte.
        len: u8,
        /// Total frame size implied by `len`.
        total: usize,
    },

    /// The trailing CRC does not match the XOR of the preceding bytes.
    #[error("CRC mismatch: computed {expected:#04x}, received {actual:#04x}")]
    CrcMismatch {
        /// CRC computed over header and payload.
        expected: u8,
        /// CRC byte found on the wire.
        actual: u8,
    },

    /// Input ended in the middle of a frame.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required for the frame announced by the header.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// No magic byte was found within the scan window.
    #[error("no frame start within {scanned} bytes")]
    NoSync {
        /// Bytes discarded while hunting.
        scanned: usize,
    },

    /// The overall decode deadline elapsed without a valid frame.
    #[error("no valid frame before deadline")]
    Timeout,
}

// =============================================================================
// Transport Errors
// =============================================================================

/// A failed request/response exchange on any adapter.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying read/write failure.
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),

    /// A write call accepted zero bytes.
    #[error("serial write accepted zero bytes")]
    ZeroWrite,

    /// The stream reached end-of-file.
    #[error("serial port disconnected")]
    Disconnected,

    /// No (complete) reply before the response timeout.
    #[error("no reply within {0:?}")]
    Timeout(std::time::Duration),

    /// The framed decode loop gave up.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A text reply did not start with an integer.
    #[error("unparseable reply: {0:?}")]
    Parse(String),
}

impl TransportError {
    /// Whether this failure matches a disconnect signature.
    ///
    /// Link-level failures trigger recovery immediately; everything else counts
    /// toward the consecutive-failure threshold instead.
    pub fn is_link_failure(&self) -> bool {
        match self {
            TransportError::ZeroWrite | TransportError::Disconnected => true,
            TransportError::Io(err) => {
                matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::PermissionDenied
                        | io::ErrorKind::NotFound
                ) || matches!(err.raw_os_error(), Some(EIO | ENXIO | ENODEV))
            }
            TransportError::Timeout(_) | TransportError::Frame(_) | TransportError::Parse(_) => {
                false
            }
        }
    }
}

// =============================================================================
// Session Errors
// =============================================================================

/// Session establishment failure.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The port could not be opened.
    #[error("failed to open port: {0:#}")]
    Open(#[source] anyhow::Error),

    /// No protocol answered the probes.
    #[error("protocol negotiation failed: no response to framed, legacy or text probes")]
    Negotiation,

    /// A protocol answered, but the initial state read failed.
    #[error("initial state read over {proto:?} failed: {source}")]
    InitialState {
        /// Negotiated protocol.
        proto: Proto,
        /// Underlying failure.
        #[source]
        source: TransportError,
    },
}

/// Outcome of a rejected or failed slot request.
#[derive(Error, Debug)]
pub enum CommandError {
    /// A command is in flight and the queue is full.
    #[error("device busy: command queue full ({capacity} pending)")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// The command was sent but the adapter reported an error.
    #[error("command dispatch failed: {0}")]
    Dispatch(#[from] TransportError),

    /// Recovery gave up; the session needs a fresh connect.
    #[error("device failed, manual intervention required")]
    DeviceFailed,

    /// The driver task has stopped.
    #[error("session is not running")]
    NotRunning,
}

/// Convenience alias for exchange results.
pub type TransportResult<T> = Result<T, TransportError>;
