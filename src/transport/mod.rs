//! Protocol adapters behind one request/response contract.
//!
//! [`Adapter`] is a closed set of the three wire variants. [`Transport`]
//! pairs the active adapter with timing and retry settings; the session
//! holds exactly one and only the negotiator ever changes its adapter.

pub mod framed;
pub mod legacy;
pub mod text;

use std::time::Duration;

use crate::config::{LinkConfig, TimingConfig};
use crate::error::TransportResult;
use crate::protocol::{FwState, Proto, Request};
use crate::serial::Link;
use crate::slots::fw_pos_to_ui;

/// One state read, as reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReport {
    /// Firmware state.
    pub state: FwState,
    /// Raw 0-based position; `0xFF` or negative when unknown.
    pub fw_pos: i32,
    /// Raw slot count; `0` before calibration.
    pub slots: i32,
}

impl StateReport {
    /// 1-based slot, if the position is known.
    pub fn slot(&self) -> Option<i32> {
        fw_pos_to_ui(self.fw_pos, self.slots)
    }
}

/// The wire protocol variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// Length-prefixed frames with XOR CRC.
    Framed,
    /// Fixed 8-byte structs.
    Legacy,
    /// CRLF command lines.
    Text,
}

impl Adapter {
    /// Matching protocol tag.
    pub fn proto(self) -> Proto {
        match self {
            Adapter::Framed => Proto::Framed,
            Adapter::Legacy => Proto::Legacy,
            Adapter::Text => Proto::Text,
        }
    }

    /// Adapter for a negotiated protocol.
    pub fn for_proto(proto: Proto) -> Option<Self> {
        match proto {
            Proto::Framed => Some(Adapter::Framed),
            Proto::Legacy => Some(Adapter::Legacy),
            Proto::Text => Some(Adapter::Text),
            Proto::Unknown => None,
        }
    }

    /// Single attempt at a request/response exchange.
    pub async fn exchange(
        self,
        link: &mut Link,
        timing: &TimingConfig,
        request: Request,
    ) -> TransportResult<i32> {
        let (cmd, value) = request.opcode();
        match self {
            Adapter::Framed => Ok(framed::exchange(link, timing, cmd, value).await?.value()),
            Adapter::Legacy => legacy::exchange(link, timing, cmd, value).await,
            Adapter::Text => text::request(link, timing, request).await,
        }
    }

    /// Single attempt at a full state read.
    pub async fn read_state(self, link: &mut Link, timing: &TimingConfig) -> TransportResult<StateReport> {
        match self {
            Adapter::Framed => framed::read_state(link, timing).await,
            Adapter::Legacy => legacy::read_state(link, timing).await,
            Adapter::Text => text::read_state(link, timing).await,
        }
    }
}

/// Retry settings for adapter operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_delay: Duration::from_millis(50),
        }
    }
}

/// The active adapter with its settings.
#[derive(Debug, Clone)]
pub struct Transport {
    adapter: Adapter,
    timing: TimingConfig,
    retry: RetryPolicy,
}

impl Transport {
    /// Transport for `adapter` using the link configuration.
    pub fn new(adapter: Adapter, config: &LinkConfig) -> Self {
        Self {
            adapter,
            timing: config.timing.clone(),
            retry: RetryPolicy {
                max_attempts: config.scheduler.retry_attempts.max(1),
                backoff_delay: config.scheduler.retry_delay,
            },
        }
    }

    /// Active adapter.
    pub fn adapter(&self) -> Adapter {
        self.adapter
    }

    /// Active protocol.
    pub fn proto(&self) -> Proto {
        self.adapter.proto()
    }

    /// Swap the active adapter in place.
    pub fn set_adapter(&mut self, adapter: Adapter) {
        self.adapter = adapter;
    }

    /// Timing settings.
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Exchange with retries. Link-level failures are returned immediately.
    pub async fn exchange(&self, link: &mut Link, request: Request) -> TransportResult<i32> {
        let mut attempt = 1;
        loop {
            match self.adapter.exchange(link, &self.timing, request).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_link_failure() || attempt >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(request = ?request, attempt, error = %e, "Retrying exchange");
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry.backoff_delay).await;
        }
    }

    /// State read with retries. Link-level failures are returned immediately.
    pub async fn read_state(&self, link: &mut Link) -> TransportResult<StateReport> {
        let mut attempt = 1;
        loop {
            match self.adapter.read_state(link, &self.timing).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_link_failure() || attempt >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(proto = %self.proto(), attempt, error = %e, "Retrying state read");
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry.backoff_delay).await;
        }
    }
}
