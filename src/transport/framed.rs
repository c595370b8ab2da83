//! Framed adapter: 11-byte request frames, CRC-checked replies.

use tokio::time::{sleep, Instant};

use super::StateReport;
use crate::config::TimingConfig;
use crate::error::{FrameError, TransportError, TransportResult};
use crate::protocol::frame::{self, DecodedFrame, FrameDecoder};
use crate::protocol::{FwState, OP_STATE};
use crate::serial::Link;

/// Send one request frame and wait for a valid reply frame.
pub async fn exchange(
    link: &mut Link,
    timing: &TimingConfig,
    cmd: u32,
    value: i32,
) -> TransportResult<DecodedFrame> {
    link.consume(link.buffered());
    link.write_all(&frame::encode(cmd, value)).await?;
    sleep(timing.framed_settle).await;

    let reply = read_frame(link, timing).await?;
    tracing::trace!(cmd = format_args!("{:#06x}", cmd), value, reply = ?reply, "Framed exchange");
    Ok(reply)
}

/// Hunt for the next valid frame until the framed deadline.
///
/// Noise and rejected candidates are skipped; individual reads are bounded
/// by the sync timeout so the deadline is checked regularly.
pub async fn read_frame(link: &mut Link, timing: &TimingConfig) -> TransportResult<DecodedFrame> {
    let deadline = Instant::now() + timing.framed_deadline;
    let mut decoder = FrameDecoder::new(timing.frame_scan_window);

    loop {
        while let Some(result) = decoder.step(link.rx_buffer()) {
            match result {
                Ok(frame) => return Ok(frame),
                Err(e) => tracing::debug!(error = %e, "Discarding frame candidate"),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FrameError::Timeout.into());
        }

        match link.read_some(remaining.min(timing.frame_sync_timeout)).await {
            Ok(_) | Err(TransportError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }
    }
}

/// One `0x1003` exchange, unpacked.
pub async fn read_state(link: &mut Link, timing: &TimingConfig) -> TransportResult<StateReport> {
    let packed = exchange(link, timing, OP_STATE, 0).await?.value() as u32;
    let state = (packed & 0xFF) as u8;
    let pos = ((packed >> 8) & 0xFF) as u8;
    let slots = ((packed >> 16) & 0xFF) as u8;

    Ok(StateReport {
        state: FwState::from_code(state),
        fw_pos: i32::from(pos),
        slots: i32::from(slots),
    })
}
