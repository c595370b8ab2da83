//! Simulated filter-wheel firmware for tests and demos.
//!
//! [`MockWheel`] holds the firmware state behind a `parking_lot::Mutex`;
//! every [`MockPort`] opened on it is a byte channel to that firmware. Each
//! write is treated as one request: an 11-byte `0xA5` frame, a CRLF text line,
//! or an 8-byte legacy struct. Anything else (such as the wake-up pattern) is
//! ignored. Replies are queued for the port to read.
//!
//! Motion and calibration advance on state reads, so tests control progress
//! by polling rather than by wall-clock time.
//!
//! # Example
//!
//! ```rust,ignore
//! let wheel = MockWheel::new(MockWheelConfig::default());
//! let session = Session::connect(wheel.opener(), LinkConfig::default()).await?;
//! wheel.unplug();   // writes now fail with BrokenPipe, reads hit EOF
//! wheel.replug();   // firmware reboots and auto-calibrates
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::protocol::frame::{self, encode_state, MAGIC, VALUE_FRAME_LEN};
use crate::protocol::{FwState, Proto, OP_POSITION, OP_SLOTS, OP_STATE, POS_UNKNOWN};
use crate::serial::{DynSerial, PortOpener};
use crate::transport::legacy;

// =============================================================================
// Configuration
// =============================================================================

/// Simulated firmware behavior.
#[derive(Debug, Clone)]
pub struct MockWheelConfig {
    /// Physical slot count discovered by calibration.
    pub slots: u8,
    /// Answers framed requests.
    pub framed: bool,
    /// Answers legacy requests.
    pub legacy: bool,
    /// Answers text requests.
    pub text: bool,
    /// State reads a move takes to finish.
    pub move_reads: u32,
    /// State reads a calibration takes to finish.
    pub calibrate_reads: u32,
    /// Firmware is calibrated at power-up.
    pub calibrated: bool,
    /// Firmware auto-calibrates after a replug.
    pub calibrate_on_replug: bool,
}

impl Default for MockWheelConfig {
    fn default() -> Self {
        Self {
            slots: 5,
            framed: true,
            legacy: true,
            text: true,
            move_reads: 2,
            calibrate_reads: 3,
            calibrated: true,
            calibrate_on_replug: true,
        }
    }
}

impl MockWheelConfig {
    /// Firmware answering only the given protocol.
    pub fn only(proto: Proto, slots: u8) -> Self {
        Self {
            slots,
            framed: proto == Proto::Framed,
            legacy: proto == Proto::Legacy,
            text: proto == Proto::Text,
            ..Default::default()
        }
    }
}

/// One request the firmware understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    /// Framed `{cmd, value}`.
    Framed {
        /// Opcode.
        cmd: u32,
        /// Value.
        value: i32,
    },
    /// Legacy `{cmd, value}`.
    Legacy {
        /// Opcode.
        cmd: u32,
        /// Value.
        value: i32,
    },
    /// Text line without terminator.
    Text(String),
}

// =============================================================================
// Firmware
// =============================================================================

#[derive(Debug)]
struct Firmware {
    config: MockWheelConfig,
    state: FwState,
    /// Persisted slot count; 0 before the first calibration.
    slots: u8,
    pos: u8,
    target: u8,
    reads_left: u32,
    plugged: bool,
    responsive: bool,
    generation: u64,
    opens: u32,
    noise: Vec<u8>,
    /// Emitted whenever nothing else is pending.
    chatter: Vec<u8>,
    rx: VecDeque<u8>,
    read_waker: Option<Waker>,
    requests: Vec<MockRequest>,
}

impl Firmware {
    fn new(config: MockWheelConfig) -> Self {
        let slots = if config.calibrated { config.slots } else { 0 };
        Self {
            config,
            state: FwState::Idle,
            slots,
            pos: 0,
            target: 0,
            reads_left: 0,
            plugged: true,
            responsive: true,
            generation: 0,
            opens: 0,
            noise: Vec::new(),
            chatter: Vec::new(),
            rx: VecDeque::new(),
            read_waker: None,
            requests: Vec::new(),
        }
    }

    fn start_move(&mut self, target: u8) {
        if self.slots == 0 || target >= self.slots {
            return;
        }
        self.target = target;
        self.pos = POS_UNKNOWN;
        self.state = FwState::Moving;
        self.reads_left = self.config.move_reads.max(1);
    }

    fn start_calibration(&mut self) {
        self.pos = POS_UNKNOWN;
        self.state = FwState::Calibrating;
        self.reads_left = self.config.calibrate_reads.max(1);
    }

    /// One state read's worth of progress.
    fn advance(&mut self) {
        if self.reads_left == 0 {
            return;
        }
        self.reads_left -= 1;
        if self.reads_left > 0 {
            return;
        }
        match self.state {
            FwState::Moving => {
                self.pos = self.target;
                self.state = FwState::Idle;
            }
            FwState::Calibrating => {
                self.slots = self.config.slots;
                self.pos = 0;
                self.state = FwState::Idle;
            }
            _ => {}
        }
    }

    fn legacy_position(&self) -> i32 {
        match self.state {
            FwState::Moving => i32::from(POS_UNKNOWN),
            FwState::Calibrating => -1,
            _ => i32::from(self.pos),
        }
    }

    fn handle_write(&mut self, bytes: &[u8]) {
        if is_frame(bytes) {
            let cmd = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
            let value = i32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
            if self.config.framed {
                self.requests.push(MockRequest::Framed { cmd, value });
                self.handle_framed(cmd, value);
            }
        } else if bytes.ends_with(b"\r\n") && bytes.is_ascii() {
            if self.config.text {
                let line = String::from_utf8_lossy(&bytes[..bytes.len() - 2]).into_owned();
                self.requests.push(MockRequest::Text(line.clone()));
                self.handle_text(&line);
            }
        } else if bytes.len() == legacy::PACKET_LEN {
            let cmd = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let value = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            if self.config.legacy {
                self.requests.push(MockRequest::Legacy { cmd, value });
                self.handle_legacy(cmd, value);
            }
        }
    }

    fn handle_framed(&mut self, cmd: u32, value: i32) {
        let reply = match (cmd, value) {
            (OP_STATE, _) => {
                self.advance();
                let state = encode_state(OP_STATE, self.state.code(), self.pos, self.slots);
                self.reply_with_noise(&state);
                return;
            }
            (OP_SLOTS, _) => i32::from(self.slots),
            (OP_POSITION, -1) => {
                self.start_calibration();
                0
            }
            (OP_POSITION, target) => {
                if let Ok(target) = u8::try_from(target) {
                    self.start_move(target);
                }
                target
            }
            _ => -1,
        };
        self.reply_with_noise(&frame::encode(cmd, reply));
    }

    fn handle_legacy(&mut self, cmd: u32, value: i32) {
        let reply = match (cmd, value) {
            (OP_POSITION, -1) => {
                self.advance();
                self.legacy_position()
            }
            (OP_POSITION, target) => {
                if let Ok(target) = u8::try_from(target) {
                    self.start_move(target);
                }
                target
            }
            (OP_SLOTS, _) => i32::from(self.slots),
            _ => -1,
        };
        self.reply(&legacy::encode(cmd, reply));
    }

    fn handle_text(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        let reply = match (parts.next(), parts.next()) {
            (Some("STATUS"), None) => {
                self.advance();
                i32::from(self.state.code()).to_string()
            }
            (Some("POS"), None) => self.legacy_position().to_string(),
            (Some("POS"), Some(arg)) => match arg.parse::<u8>() {
                Ok(target) => {
                    self.start_move(target);
                    "OK".to_string()
                }
                Err(_) => "ERR bad position".to_string(),
            },
            (Some("SLOTS"), None) => self.slots.to_string(),
            (Some("CALIBRATE"), None) => {
                self.start_calibration();
                "OK".to_string()
            }
            _ => "ERR unknown command".to_string(),
        };
        self.reply(format!("{}\r\n", reply).as_bytes());
    }

    fn reply_with_noise(&mut self, bytes: &[u8]) {
        let noise = std::mem::take(&mut self.noise);
        self.reply(&noise);
        self.noise = noise;
        self.reply(bytes);
    }

    fn reply(&mut self, bytes: &[u8]) {
        if !self.responsive || bytes.is_empty() {
            return;
        }
        self.rx.extend(bytes);
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn disconnect_ports(&mut self) {
        self.generation += 1;
        self.rx.clear();
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

fn is_frame(bytes: &[u8]) -> bool {
    bytes.len() == VALUE_FRAME_LEN
        && bytes[0] == MAGIC
        && bytes[1] == 8
        && frame::xor_crc(&bytes[..VALUE_FRAME_LEN - 1]) == bytes[VALUE_FRAME_LEN - 1]
}

// =============================================================================
// MockWheel
// =============================================================================

/// Handle to the simulated firmware. Clones share the same firmware.
#[derive(Debug, Clone)]
pub struct MockWheel {
    fw: Arc<Mutex<Firmware>>,
}

impl MockWheel {
    /// Powered-up firmware.
    pub fn new(config: MockWheelConfig) -> Self {
        Self {
            fw: Arc::new(Mutex::new(Firmware::new(config))),
        }
    }

    /// Opener producing ports on this firmware.
    pub fn opener(&self) -> MockOpener {
        MockOpener { wheel: self.clone() }
    }

    /// Open a port directly. Fails while unplugged.
    pub fn open_port(&self) -> io::Result<MockPort> {
        let mut fw = self.fw.lock();
        if !fw.plugged {
            return Err(io::Error::new(io::ErrorKind::NotFound, "mock wheel unplugged"));
        }
        fw.disconnect_ports();
        fw.opens += 1;
        Ok(MockPort {
            fw: Arc::clone(&self.fw),
            generation: fw.generation,
        })
    }

    /// Pull the USB cable.
    pub fn unplug(&self) {
        let mut fw = self.fw.lock();
        fw.plugged = false;
        fw.disconnect_ports();
    }

    /// Plug back in; the firmware reboots and, if configured, auto-calibrates.
    pub fn replug(&self) {
        let mut fw = self.fw.lock();
        fw.plugged = true;
        fw.disconnect_ports();
        if fw.config.calibrate_on_replug {
            fw.start_calibration();
        } else {
            fw.state = FwState::Idle;
            fw.reads_left = 0;
        }
    }

    /// Stop (or resume) answering requests. Writes still succeed.
    pub fn set_responsive(&self, responsive: bool) {
        self.fw.lock().responsive = responsive;
    }

    /// Change which protocols the firmware answers.
    pub fn set_protocols(&self, framed: bool, legacy: bool, text: bool) {
        let mut fw = self.fw.lock();
        fw.config.framed = framed;
        fw.config.legacy = legacy;
        fw.config.text = text;
    }

    /// Debug text written before every framed reply.
    pub fn set_noise(&self, noise: &[u8]) {
        self.fw.lock().noise = noise.to_vec();
    }

    /// Debug text the firmware prints whenever the line is otherwise idle.
    ///
    /// With chatter set, reads never stall: the line is never quiet.
    pub fn set_chatter(&self, chatter: &[u8]) {
        self.fw.lock().chatter = chatter.to_vec();
    }

    /// Install a wheel with a different slot count; seen after the next calibration.
    pub fn swap_wheel(&self, slots: u8) {
        self.fw.lock().config.slots = slots;
    }

    /// Begin calibrating as if the firmware had rebooted.
    pub fn start_calibration(&self) {
        self.fw.lock().start_calibration();
    }

    /// Requests the firmware understood, oldest first.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.fw.lock().requests.clone()
    }

    /// Forget the request log.
    pub fn clear_requests(&self) {
        self.fw.lock().requests.clear();
    }

    /// Current firmware state.
    pub fn state(&self) -> FwState {
        self.fw.lock().state
    }

    /// Current 0-based position (`0xFF` while moving).
    pub fn position(&self) -> u8 {
        self.fw.lock().pos
    }

    /// Slot count the firmware reports.
    pub fn reported_slots(&self) -> u8 {
        self.fw.lock().slots
    }

    /// Successful port opens.
    pub fn open_count(&self) -> u32 {
        self.fw.lock().opens
    }
}

/// [`PortOpener`] over a [`MockWheel`].
#[derive(Debug, Clone)]
pub struct MockOpener {
    wheel: MockWheel,
}

impl MockOpener {
    /// Underlying wheel.
    pub fn wheel(&self) -> &MockWheel {
        &self.wheel
    }
}

#[async_trait]
impl PortOpener for MockOpener {
    async fn open(&self) -> anyhow::Result<DynSerial> {
        let port = self.wheel.open_port()?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        "mock filter wheel".to_string()
    }
}

// =============================================================================
// MockPort
// =============================================================================

/// Byte channel to the simulated firmware.
///
/// Becomes dead (EOF on read, `BrokenPipe` on write) once the wheel is
/// unplugged or another port is opened.
#[derive(Debug)]
pub struct MockPort {
    fw: Arc<Mutex<Firmware>>,
    generation: u64,
}

impl MockPort {
    fn is_live(&self, fw: &Firmware) -> bool {
        fw.plugged && fw.generation == self.generation
    }
}

impl AsyncRead for MockPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut fw = self.fw.lock();
        if !self.is_live(&fw) {
            // End-of-file
            return Poll::Ready(Ok(()));
        }
        if fw.rx.is_empty() && fw.responsive && !fw.chatter.is_empty() {
            let chatter = fw.chatter.clone();
            fw.rx.extend(chatter);
        }
        if fw.rx.is_empty() {
            fw.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.remaining().min(fw.rx.len());
        let chunk: Vec<u8> = fw.rx.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut fw = self.fw.lock();
        if !self.is_live(&fw) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock wheel disconnected",
            )));
        }
        fw.handle_write(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{decode, DecodedFrame};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_framed_state_read_advances_motion() {
        let wheel = MockWheel::new(MockWheelConfig::default());
        let mut port = wheel.open_port().unwrap();

        port.write_all(&frame::encode(OP_POSITION, 2)).await.unwrap();
        let mut ack = [0u8; 11];
        port.read_exact(&mut ack).await.unwrap();
        assert_eq!(wheel.state(), FwState::Moving);

        for expected in [FwState::Moving, FwState::Idle] {
            port.write_all(&frame::encode(OP_STATE, 0)).await.unwrap();
            let mut reply = [0u8; 15];
            port.read_exact(&mut reply).await.unwrap();
            match decode(&reply).unwrap() {
                DecodedFrame::State { state, .. } => assert_eq!(FwState::from_code(state), expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(wheel.position(), 2);
    }

    #[tokio::test]
    async fn test_unplug_kills_port() {
        let wheel = MockWheel::new(MockWheelConfig::default());
        let mut port = wheel.open_port().unwrap();
        wheel.unplug();

        let err = port.write_all(b"SLOTS\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).await.unwrap(), 0);
        assert!(wheel.open_port().is_err());

        wheel.replug();
        assert_eq!(wheel.state(), FwState::Calibrating);
        assert!(wheel.open_port().is_ok());
    }

    #[tokio::test]
    async fn test_unsupported_protocol_is_ignored() {
        let wheel = MockWheel::new(MockWheelConfig::only(Proto::Text, 5));
        let mut port = wheel.open_port().unwrap();

        port.write_all(&frame::encode(OP_SLOTS, 0)).await.unwrap();
        port.write_all(b"SLOTS\r\n").await.unwrap();
        let mut reply = [0u8; 3];
        port.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"5\r\n");
        assert_eq!(wheel.requests(), vec![MockRequest::Text("SLOTS".to_string())]);
    }
}
