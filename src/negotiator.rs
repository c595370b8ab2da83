//! Protocol discovery.
//!
//! There is no out-of-band signal telling which protocol a firmware speaks,
//! so each one is probed with a slot-count request, best first:
//! Framed, then Legacy, then Text. The first that answers is pinned.
//!
//! A session that landed on a fallback periodically retries Framed; some
//! firmware only answers it once boot-time housekeeping has finished.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::instrument;

use crate::config::{LinkConfig, UpgradeConfig};
use crate::error::ConnectError;
use crate::protocol::{FwState, Proto, Request};
use crate::serial::Link;
use crate::transport::Adapter;

/// Line stimulus sent before a binary probe.
pub const WAKE_PATTERN: [u8; 6] = [0x00, 0xFF, 0x00, 0xFF, 0xA5, 0x24];

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Pinned adapter.
    pub adapter: Adapter,
    /// Value returned by the slot-count probe.
    pub slots: i32,
}

/// Probe all three protocols in preference order.
#[instrument(skip_all, err)]
pub async fn negotiate(link: &mut Link, config: &LinkConfig) -> Result<Negotiated, ConnectError> {
    let timing = &config.timing;

    if let Err(e) = link
        .flush(timing.flush_window, timing.flush_limit, timing.flush_max_bytes)
        .await
    {
        tracing::debug!(error = %e, "Flush before negotiation failed");
    }
    if let Err(e) = link.write_all(&WAKE_PATTERN).await {
        tracing::debug!(error = %e, "Wake-up pattern not sent");
    }
    sleep(timing.wake_settle).await;

    match Adapter::Framed.exchange(link, timing, Request::GetSlots).await {
        Ok(slots) if slots > 0 => return Ok(pinned(Adapter::Framed, slots)),
        Ok(slots) => tracing::debug!(slots, "Framed probe answered without a slot count"),
        Err(e) => tracing::debug!(error = %e, "Framed probe failed"),
    }

    sleep(timing.probe_gap).await;
    match Adapter::Legacy.exchange(link, timing, Request::GetSlots).await {
        Ok(slots) => return Ok(pinned(Adapter::Legacy, slots)),
        Err(e) => tracing::debug!(error = %e, "Legacy probe failed"),
    }

    sleep(timing.probe_gap).await;
    match Adapter::Text.exchange(link, timing, Request::GetSlots).await {
        Ok(slots) => return Ok(pinned(Adapter::Text, slots)),
        Err(e) => tracing::debug!(error = %e, "Text probe failed"),
    }

    tracing::error!("No protocol answered; check the port and firmware");
    Err(ConnectError::Negotiation)
}

fn pinned(adapter: Adapter, slots: i32) -> Negotiated {
    tracing::info!(proto = %adapter.proto(), slots, "Protocol negotiated");
    Negotiated { adapter, slots }
}

/// Single silent Framed probe. Returns the slot count on success.
#[instrument(skip_all)]
pub async fn try_upgrade(link: &mut Link, config: &LinkConfig) -> Option<i32> {
    let timing = &config.timing;
    let upgrade = &config.upgrade;

    link.flush(timing.flush_window, timing.flush_limit, timing.flush_max_bytes)
        .await
        .ok()?;
    sleep(upgrade.flush_settle).await;
    link.write_all(&WAKE_PATTERN).await.ok()?;
    sleep(upgrade.wake_settle).await;

    match Adapter::Framed.exchange(link, timing, Request::GetSlots).await {
        Ok(slots) if slots > 0 => Some(slots),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "Upgrade probe failed");
            None
        }
    }
}

/// Rate limit for upgrade attempts.
#[derive(Debug, Clone)]
pub struct UpgradeSchedule {
    enabled: bool,
    interval: Duration,
    last_attempt: Instant,
}

impl UpgradeSchedule {
    /// Window starts now.
    pub fn new(config: &UpgradeConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval,
            last_attempt: Instant::now(),
        }
    }

    /// An attempt is allowed: not on Framed, device idle, link healthy,
    /// and the interval has passed since the last attempt.
    pub fn due(&self, now: Instant, proto: Proto, state: FwState, busy: bool) -> bool {
        self.enabled
            && proto != Proto::Framed
            && state == FwState::Idle
            && !busy
            && now.saturating_duration_since(self.last_attempt) >= self.interval
    }

    /// Start a new window.
    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = now;
    }
}
