//! Legacy adapter: raw 8-byte `{cmd: u32, value: i32}` structs.
//!
//! No framing, no checksum. Kept only for firmware that predates the framed
//! protocol.

use super::StateReport;
use crate::config::TimingConfig;
use crate::error::TransportResult;
use crate::protocol::{FwState, Request, POS_UNKNOWN};
use crate::serial::Link;

/// Size of a request and of a reply.
pub const PACKET_LEN: usize = 8;

/// Encode a request struct.
pub fn encode(cmd: u32, value: i32) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[..4].copy_from_slice(&cmd.to_le_bytes());
    packet[4..].copy_from_slice(&value.to_le_bytes());
    packet
}

/// Send one request and read the 8-byte reply; returns the reply value.
pub async fn exchange(
    link: &mut Link,
    timing: &TimingConfig,
    cmd: u32,
    value: i32,
) -> TransportResult<i32> {
    link.consume(link.buffered());
    link.write_all(&encode(cmd, value)).await?;

    let reply = link.read_exact(PACKET_LEN, timing.legacy_timeout).await?;
    let out = i32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]);
    tracing::trace!(cmd = format_args!("{:#06x}", cmd), value, out, "Legacy exchange");
    Ok(out)
}

/// Position read followed by slot count read.
///
/// Legacy firmware has no state opcode; the state is inferred from the
/// position: `0xFF` while moving, negative while calibrating.
pub async fn read_state(link: &mut Link, timing: &TimingConfig) -> TransportResult<StateReport> {
    let (cmd, value) = Request::GetPosition.opcode();
    let fw_pos = exchange(link, timing, cmd, value).await?;
    let (cmd, value) = Request::GetSlots.opcode();
    let slots = exchange(link, timing, cmd, value).await?;

    Ok(StateReport {
        state: infer_state(fw_pos),
        fw_pos,
        slots,
    })
}

/// State implied by a legacy position reply.
pub fn infer_state(fw_pos: i32) -> FwState {
    if fw_pos == i32::from(POS_UNKNOWN) {
        FwState::Moving
    } else if fw_pos < 0 {
        FwState::Calibrating
    } else {
        FwState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    fn reply(cmd: u32, value: i32) -> [u8; PACKET_LEN] {
        encode(cmd, value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_state_idle() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode(0x1001, -1))
            .read(&reply(0x1001, 2))
            .write(&encode(0x1002, 0))
            .read(&reply(0x1002, 5))
            .build();
        let mut link = Link::new(Box::new(mock));

        let report = read_state(&mut link, &TimingConfig::default()).await.unwrap();
        assert_eq!(report.state, FwState::Idle);
        assert_eq!(report.slot(), Some(3));
        assert_eq!(report.slots, 5);
    }

    #[test]
    fn test_infer_state() {
        assert_eq!(infer_state(0xFF), FwState::Moving);
        assert_eq!(infer_state(-1), FwState::Calibrating);
        assert_eq!(infer_state(0), FwState::Idle);
        assert_eq!(infer_state(4), FwState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reply_times_out() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode(0x1002, 0))
            .read(&[0x02, 0x10, 0x00])
            .wait(std::time::Duration::from_secs(10))
            .build();
        let mut link = Link::new(Box::new(mock));

        let err = exchange(&mut link, &TimingConfig::default(), 0x1002, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
