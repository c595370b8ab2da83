//! Byte channel to the wheel controller.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`Link`]: a `DynSerial` plus a receive buffer, exposing the timeout-bounded
//!   primitives the protocol adapters are written against
//! - [`PortOpener`]: (re)opens the physical port; recovery needs to call it again
//!   after a USB disconnect
//!
//! With the `serial` feature, [`SerialOpener`] opens real hardware through
//! `tokio-serial`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

use crate::error::{TransportError, TransportResult};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` and `tokio_test::io::Mock` (testing)
/// - [`crate::mock::MockPort`]
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Port Opener
// =============================================================================

/// Opens the physical port.
///
/// Called once by `Session::connect` and again by recovery each time it tries
/// to re-establish the link.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open a fresh byte channel.
    async fn open(&self) -> anyhow::Result<DynSerial>;

    /// Human-readable port name for logs.
    fn describe(&self) -> String;
}

/// Opens a real serial device, 8N1, no flow control.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialOpener {
    /// Device path (e.g., "/dev/ttyACM0")
    pub device_path: String,
    /// Baud rate
    pub baud_rate: u32,
}

#[cfg(feature = "serial")]
impl SerialOpener {
    /// Opener for the `[port]` section of the link configuration.
    pub fn from_config(config: &crate::config::PortConfig) -> Self {
        Self {
            device_path: config.device_path.clone(),
            baud_rate: config.baud_rate,
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self) -> anyhow::Result<DynSerial> {
        let port = open_serial_async(&self.device_path, self.baud_rate).await?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.device_path, self.baud_rate)
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!("Failed to open filter wheel port: {}", port_path_owned))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

// =============================================================================
// Link
// =============================================================================

/// A serial port with a receive buffer.
///
/// Bytes read past what one call consumed stay buffered for the next call,
/// so a reply split across reads, or two replies arriving in one read, are
/// both handled.
pub struct Link {
    port: DynSerial,
    rx: BytesMut,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("buffered", &self.rx.len())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Wrap an open port.
    pub fn new(port: DynSerial) -> Self {
        Self {
            port,
            rx: BytesMut::with_capacity(256),
        }
    }

    /// Number of received bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Receive buffer, for decoders that consume it in place.
    pub fn rx_buffer(&mut self) -> &mut BytesMut {
        &mut self.rx
    }

    /// Write all bytes and flush.
    ///
    /// A write that makes no progress is a link-level failure.
    pub async fn write_all(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let mut written = 0;
        while written < bytes.len() {
            let n = self.port.write(&bytes[written..]).await?;
            if n == 0 {
                return Err(TransportError::ZeroWrite);
            }
            written += n;
        }
        self.port.flush().await?;
        Ok(())
    }

    /// Read at least one more byte into the receive buffer.
    ///
    /// Returns the number of bytes appended.
    pub async fn read_some(&mut self, limit: Duration) -> TransportResult<usize> {
        let mut chunk = [0u8; 256];
        match timeout(limit, self.port.read(&mut chunk)).await {
            Ok(Ok(0)) => Err(TransportError::Disconnected),
            Ok(Ok(n)) => {
                self.rx.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize, limit: Duration) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + limit;
        while self.rx.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(limit));
            }
            self.read_some(remaining)
                .await
                .map_err(|e| retag_timeout(e, limit))?;
        }
        Ok(self.rx.split_to(n).to_vec())
    }

    /// Read up to and including `delim`.
    pub async fn read_until(&mut self, delim: u8, limit: Duration) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + limit;
        let mut searched = 0;
        loop {
            if let Some(pos) = self.rx[searched..].iter().position(|&b| b == delim) {
                return Ok(self.rx.split_to(searched + pos + 1).to_vec());
            }
            searched = self.rx.len();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(limit));
            }
            self.read_some(remaining)
                .await
                .map_err(|e| retag_timeout(e, limit))?;
        }
    }

    /// Discard buffered and pending input, then flush output.
    ///
    /// Pending input is drained until the line has been quiet for `window`.
    /// A line that keeps talking is abandoned after `limit` or `max_bytes`,
    /// whichever comes first. Returns the number of bytes discarded.
    pub async fn flush(
        &mut self,
        window: Duration,
        limit: Duration,
        max_bytes: usize,
    ) -> TransportResult<usize> {
        let deadline = Instant::now() + limit;
        let mut discarded = self.rx.len();
        self.rx.clear();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || discarded >= max_bytes {
                tracing::debug!(discarded, "Line never went quiet, continuing");
                break;
            }
            match self.read_some(window.min(remaining)).await {
                Ok(n) => {
                    discarded += n;
                    self.rx.clear();
                }
                Err(TransportError::Timeout(_)) if Instant::now() < deadline => break,
                Err(TransportError::Timeout(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.port.flush().await?;
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded stale input");
        }
        Ok(discarded)
    }

    /// Drop `n` bytes from the front of the receive buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.rx.len());
        self.rx.advance(n);
    }

    /// Shut the port down, releasing it.
    pub async fn close(mut self) {
        if let Err(e) = self.port.shutdown().await {
            tracing::debug!(error = %e, "Port shutdown reported an error");
        }
    }
}

fn retag_timeout(err: TransportError, limit: Duration) -> TransportError {
    match err {
        TransportError::Timeout(_) => TransportError::Timeout(limit),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_exact_across_chunks() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = Link::new(Box::new(device));

        host.write_all(b"abc").await.unwrap();
        host.write_all(b"defgh").await.unwrap();

        let bytes = link.read_exact(5, Duration::from_millis(100)).await.unwrap();
        assert_eq!(bytes, b"abcde");
        assert_eq!(link.buffered(), 3);
    }

    #[tokio::test]
    async fn test_read_until_keeps_remainder() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = Link::new(Box::new(device));

        host.write_all(b"12\r\n34\r\n").await.unwrap();

        let first = link.read_until(b'\n', Duration::from_millis(100)).await.unwrap();
        assert_eq!(first, b"12\r\n");
        let second = link.read_until(b'\n', Duration::from_millis(100)).await.unwrap();
        assert_eq!(second, b"34\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_exact_times_out() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = Link::new(Box::new(device));

        host.write_all(b"ab").await.unwrap();

        let err = link.read_exact(8, Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_secs(3)));
        assert!(!err.is_link_failure());
    }

    #[tokio::test]
    async fn test_eof_is_link_failure() {
        let (host, device) = tokio::io::duplex(64);
        let mut link = Link::new(Box::new(device));
        drop(host);

        let err = link.read_exact(1, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
        assert!(err.is_link_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_discards_stale_input() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = Link::new(Box::new(device));

        host.write_all(b"boot: ok\r\n").await.unwrap();
        let discarded = link
            .flush(Duration::from_millis(50), Duration::from_millis(500), 4096)
            .await
            .unwrap();
        assert_eq!(discarded, 10);
        assert_eq!(link.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_gives_up_on_chattering_line() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut link = Link::new(Box::new(device));

        let chatter = tokio::spawn(async move {
            loop {
                if host.write_all(b"dbg\r\n").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let start = Instant::now();
        let discarded = link
            .flush(Duration::from_millis(50), Duration::from_millis(500), 4096)
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed <= Duration::from_millis(520), "elapsed {elapsed:?}");
        assert!(discarded >= 5 * 20, "discarded {discarded}");

        drop(link);
        chatter.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_stops_at_byte_budget() {
        let (mut host, device) = tokio::io::duplex(4096);
        let mut link = Link::new(Box::new(device));

        host.write_all(&[b'x'; 2048]).await.unwrap();
        let discarded = link
            .flush(Duration::from_millis(50), Duration::from_secs(30), 512)
            .await
            .unwrap();
        assert!((512..2048).contains(&discarded), "discarded {discarded}");
    }
}
