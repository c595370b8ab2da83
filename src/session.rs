//! The session: one negotiated link to one wheel.
//!
//! A [`Session`] owns every piece of mutable link state: the port, the
//! active adapter, the device state cache, the command scheduler, recovery
//! and poll health. It is driven from one logical thread:
//!
//! - [`Session::poll`] is the tick. It performs at most one state read (or
//!   one recovery step) and at most one queued dispatch, and returns the
//!   delay until the next tick.
//! - [`Session::request_slot`] admits a command, dispatching it immediately
//!   when the device is free.
//!
//! See [`crate::driver`] for a tokio task that runs this loop.

use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::instrument;

use crate::config::LinkConfig;
use crate::error::{CommandError, ConnectError, TransportError};
use crate::negotiator::{self, UpgradeSchedule};
use crate::poll::{poll_delay, CommHealth, LinkHealth};
use crate::protocol::{FwState, Proto, Request};
use crate::recovery::{Recovery, RecoveryState, RecoveryStep};
use crate::scheduler::{Admission, QueuedCommand, Scheduler};
use crate::serial::{Link, PortOpener};
use crate::slots::{clamp_slot, ui_pos_to_fw, FilterNames};
use crate::state::{Applied, DeviceState};
use crate::transport::{Adapter, StateReport, Transport};

// =============================================================================
// Public Types
// =============================================================================

/// Result of a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Negotiated protocol.
    pub proto: Proto,
    /// Slot count; `0` if the wheel is uncalibrated.
    pub total_slots: i32,
    /// 1-based slot; `0` if unknown.
    pub current_slot: i32,
}

/// What happened to a slot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Sent to the device.
    Dispatched(QueuedCommand),
    /// Device busy; will be sent when it is free.
    Queued {
        /// The queued command (after clamping).
        command: QueuedCommand,
        /// Queue length after insertion.
        depth: usize,
    },
}

/// Something the host may want to surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    /// The wheel reached the requested slot.
    MoveComplete {
        /// 1-based slot.
        slot: i32,
    },
    /// A calibration finished and reported a slot count.
    CalibrationComplete {
        /// Slot count.
        slots: i32,
    },
    /// The slot count changed; filter names were resized.
    SlotCountChanged {
        /// Previous count (`0` if unknown).
        old: i32,
        /// New count.
        new: i32,
    },
    /// A link failure started recovery.
    RecoveryStarted,
    /// The link is back and the device is ready.
    RecoveryComplete,
    /// Recovery timed out; manual intervention required.
    RecoveryFailed,
    /// The session switched to a better protocol.
    ProtocolUpgraded {
        /// Previous protocol.
        from: Proto,
        /// New protocol.
        to: Proto,
    },
    /// A queued command could not be sent.
    CommandFailed {
        /// The command.
        command: QueuedCommand,
        /// Error description.
        error: String,
    },
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Last observed firmware state.
    pub state: FwState,
    /// Slot from the latest read; `0` if unknown.
    pub current_slot: i32,
    /// Last valid slot ever observed; `0` if none yet.
    pub last_known_slot: i32,
    /// Slot count; `0` if unknown.
    pub total_slots: i32,
    /// Delay until the next tick.
    pub next_delay: Duration,
    /// Recovery state.
    pub recovery: RecoveryState,
    /// Link health.
    pub health: LinkHealth,
    /// Events since the previous tick.
    pub events: Vec<SessionEvent>,
}

// =============================================================================
// Session
// =============================================================================

/// A negotiated link to one wheel.
pub struct Session<O: PortOpener> {
    opener: O,
    config: LinkConfig,
    link: Option<Link>,
    transport: Transport,
    cache: DeviceState,
    scheduler: Scheduler,
    recovery: Recovery,
    health: CommHealth,
    upgrade: UpgradeSchedule,
    failed: bool,
    events: Vec<SessionEvent>,
}

impl<O: PortOpener> std::fmt::Debug for Session<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("port", &self.opener.describe())
            .field("proto", &self.transport.proto())
            .field("cache", &self.cache)
            .field("recovery", &self.recovery.state())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<O: PortOpener> Session<O> {
    /// Open the port, negotiate a protocol and read the initial state.
    #[instrument(skip_all, fields(port = %opener.describe()), err)]
    pub async fn connect(opener: O, config: LinkConfig) -> Result<Self, ConnectError> {
        let port = opener.open().await.map_err(ConnectError::Open)?;
        let mut link = Link::new(port);
        sleep(config.timing.connect_settle).await;

        let negotiated = match negotiator::negotiate(&mut link, &config).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        let transport = Transport::new(negotiated.adapter, &config);
        let report = match transport.read_state(&mut link).await {
            Ok(report) => report,
            Err(source) => {
                link.close().await;
                return Err(ConnectError::InitialState {
                    proto: negotiated.adapter.proto(),
                    source,
                });
            }
        };

        let mut session = Self {
            scheduler: Scheduler::new(config.scheduler.queue_capacity),
            recovery: Recovery::new(config.recovery.timeout),
            upgrade: UpgradeSchedule::new(&config.upgrade),
            health: CommHealth::default(),
            cache: DeviceState::default(),
            link: Some(link),
            transport,
            opener,
            config,
            failed: false,
            events: Vec::new(),
        };
        session.cache.apply(&report);

        tracing::info!(
            proto = %session.transport.proto(),
            slots = session.cache.total_slots,
            slot = session.cache.current_slot,
            state = ?session.cache.fw_state,
            "Connected to filter wheel"
        );
        Ok(session)
    }

    /// Protocol, slot count and current slot.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            proto: self.transport.proto(),
            total_slots: self.cache.total_slots,
            current_slot: self.cache.current_slot,
        }
    }

    /// Request a slot. `0` calibrates.
    ///
    /// Slots outside `[1, total]` are clamped. With an unknown slot count a
    /// calibration is started first and the move waits for it.
    #[instrument(skip(self), fields(proto = %self.transport.proto()))]
    pub async fn request_slot(&mut self, requested: i32) -> Result<RequestOutcome, CommandError> {
        if self.failed {
            return Err(CommandError::DeviceFailed);
        }

        if requested == 0 {
            return self.submit(QueuedCommand::Calibrate).await;
        }

        let total = self.cache.total_slots;
        if total <= 0 {
            tracing::info!(requested, "Calibration required, calibrating before move");
            self.submit(QueuedCommand::Calibrate).await?;
            return self.submit(QueuedCommand::MoveToSlot(requested.max(1))).await;
        }

        let (slot, clamped) = clamp_slot(requested, total);
        if clamped {
            tracing::warn!(requested, slot, total_slots = total, "Requested slot out of range, clamping");
        }
        self.submit(QueuedCommand::MoveToSlot(slot)).await
    }

    /// One tick: a state read or recovery step, then at most one dispatch.
    #[instrument(skip(self), fields(proto = %self.transport.proto()))]
    pub async fn poll(&mut self) -> PollResult {
        if self.failed {
            return self.result();
        }

        if self.recovery.is_active() {
            if self.recovery.timed_out(Instant::now()) {
                self.give_up();
            } else if let Some(deadline) = self.recovery.deadline() {
                if timeout_at(deadline, self.step_recovery()).await.is_err() {
                    self.give_up();
                }
            }
            return self.result();
        }

        let outcome = match self.link.as_mut() {
            Some(link) => self.transport.read_state(link).await,
            None => Err(TransportError::Disconnected),
        };

        match outcome {
            Ok(report) => {
                self.health.on_success();
                self.on_report(&report).await;
                self.maybe_upgrade().await;
            }
            Err(e) => self.on_poll_failure(e),
        }
        self.result()
    }

    /// Close the port and hand back the opener. All session state is dropped.
    pub async fn disconnect(mut self) -> O {
        self.scheduler.clear();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        tracing::info!(port = %self.opener.describe(), "Disconnected from filter wheel");
        self.opener
    }

    /// Device state cache.
    pub fn device_state(&self) -> &DeviceState {
        &self.cache
    }

    /// Command queue and in-flight flag.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Recovery state.
    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// Recovery gave up; a fresh connect is needed.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Filter labels.
    pub fn filter_names(&self) -> &FilterNames {
        &self.cache.names
    }

    /// Rename a 1-based slot. Returns false if the slot does not exist.
    pub fn set_filter_name(&mut self, slot: i32, name: impl Into<String>) -> bool {
        self.cache.names.set(slot, name)
    }

    /// Link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn submit(&mut self, cmd: QueuedCommand) -> Result<RequestOutcome, CommandError> {
        let admission = self.scheduler.enqueue(
            cmd,
            self.cache.fw_state,
            self.cache.total_slots,
            self.recovery.is_active(),
        )?;
        match admission {
            Admission::DispatchNow(cmd) => {
                let sent = self.dispatch(cmd).await?;
                Ok(RequestOutcome::Dispatched(sent))
            }
            Admission::Queued { depth } => Ok(RequestOutcome::Queued {
                command: cmd,
                depth,
            }),
        }
    }

    /// Send a command and mark it in flight. Returns the command as sent.
    async fn dispatch(&mut self, cmd: QueuedCommand) -> Result<QueuedCommand, CommandError> {
        let (cmd, request) = match cmd {
            QueuedCommand::Calibrate => {
                self.cache.target_slot = 0;
                (cmd, Request::Calibrate)
            }
            QueuedCommand::MoveToSlot(slot) => {
                // The slot count may have changed while this was queued
                let (slot, clamped) = clamp_slot(slot, self.cache.total_slots);
                if clamped {
                    tracing::warn!(slot, total_slots = self.cache.total_slots, "Queued slot out of range, clamping");
                }
                self.cache.target_slot = slot;
                let fw_pos = ui_pos_to_fw(slot).unwrap_or(0);
                (QueuedCommand::MoveToSlot(slot), Request::SetPosition(fw_pos))
            }
        };

        self.scheduler.mark_dispatched(cmd);

        let outcome = match self.link.as_mut() {
            Some(link) => self.transport.exchange(link, request).await,
            None => Err(TransportError::Disconnected),
        };

        match outcome {
            Ok(reply) => {
                tracing::info!(command = %cmd, proto = %self.transport.proto(), reply, "Command dispatched");
                Ok(cmd)
            }
            Err(e) => {
                tracing::warn!(command = %cmd, error = %e, "Command dispatch failed");
                if e.is_link_failure() {
                    self.begin_recovery();
                }
                Err(CommandError::Dispatch(e))
            }
        }
    }

    async fn process_queue(&mut self) {
        let next = self.scheduler.next_ready(
            self.cache.fw_state,
            self.cache.total_slots,
            self.recovery.is_active(),
        );
        if let Some(cmd) = next {
            tracing::info!(command = %cmd, "Processing queued command");
            if let Err(e) = self.dispatch(cmd).await {
                self.events.push(SessionEvent::CommandFailed {
                    command: cmd,
                    error: e.to_string(),
                });
            }
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    fn apply_report(&mut self, report: &StateReport) -> Applied {
        let applied = self.cache.apply(report);
        if let Some((old, new)) = applied.slots_changed {
            self.events.push(SessionEvent::SlotCountChanged { old, new });
        }
        applied
    }

    async fn on_report(&mut self, report: &StateReport) {
        self.apply_report(report);

        if report.state != FwState::Idle {
            return;
        }

        if self.scheduler.on_idle(self.cache.total_slots) {
            tracing::info!(slots = self.cache.total_slots, "Calibration complete");
            self.events.push(SessionEvent::CalibrationComplete {
                slots: self.cache.total_slots,
            });
        }

        let target = self.cache.target_slot;
        if target > 0 && self.cache.current_slot == target {
            tracing::info!(slot = target, "Move complete");
            self.events.push(SessionEvent::MoveComplete { slot: target });
        }
        self.cache.target_slot = 0;

        self.process_queue().await;
    }

    fn on_poll_failure(&mut self, err: TransportError) {
        if err.is_link_failure() {
            tracing::warn!(error = %err, "Link failure detected");
            self.begin_recovery();
            return;
        }

        let outcome = self.health.on_failure(
            self.config.poll.backoff_after,
            self.config.recovery.failure_threshold,
        );
        tracing::warn!(
            error = %err,
            failures = self.health.consecutive_failures(),
            backoff = outcome.backoff,
            "State poll failed"
        );
        if outcome.recover {
            self.begin_recovery();
        }
    }

    async fn maybe_upgrade(&mut self) {
        let now = Instant::now();
        let busy = self.health.backoff() || self.scheduler.in_flight();
        if !self
            .upgrade
            .due(now, self.transport.proto(), self.cache.fw_state, busy)
        {
            return;
        }
        self.upgrade.record_attempt(now);

        let Some(link) = self.link.as_mut() else {
            return;
        };
        tracing::debug!(proto = %self.transport.proto(), "Attempting protocol upgrade");
        if let Some(slots) = negotiator::try_upgrade(link, &self.config).await {
            let from = self.transport.proto();
            self.transport.set_adapter(Adapter::Framed);
            tracing::info!(from = %from, slots, "Protocol upgraded to framed");
            self.events.push(SessionEvent::ProtocolUpgraded {
                from,
                to: Proto::Framed,
            });
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    fn begin_recovery(&mut self) {
        if !self.recovery.begin(Instant::now()) {
            return;
        }

        let target = self.cache.target_slot;
        tracing::warn!(
            target_slot = target,
            state = ?self.cache.fw_state,
            queued = self.scheduler.len(),
            "Starting link recovery"
        );

        if target > 0 {
            // The interrupted move goes first
            self.scheduler.reseed(target);
        } else {
            self.scheduler.drain_for_recovery();
        }
        self.scheduler.clear_calibration_wait();
        self.health.reset();
        self.cache.invalidate_position();
        self.events.push(SessionEvent::RecoveryStarted);
    }

    async fn step_recovery(&mut self) {
        match self.recovery.state() {
            RecoveryState::InProgress => self.reconnect().await,
            RecoveryState::WaitCalibration => self.check_calibration().await,
            RecoveryState::None => {}
        }
    }

    async fn reconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        sleep(self.config.recovery.reconnect_settle).await;

        let port = match self.opener.open().await {
            Ok(port) => port,
            Err(e) => {
                tracing::debug!(error = %e, "Reopen failed, will retry");
                return;
            }
        };
        let mut link = Link::new(port);

        let negotiated = match negotiator::negotiate(&mut link, &self.config).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::debug!(error = %e, "Renegotiation failed, will retry");
                return;
            }
        };
        if negotiated.adapter != self.transport.adapter() {
            tracing::info!(
                from = %self.transport.proto(),
                to = %negotiated.adapter.proto(),
                "Protocol changed after reconnect"
            );
        }
        self.transport.set_adapter(negotiated.adapter);

        let report = match self.transport.read_state(&mut link).await {
            Ok(report) => report,
            Err(e) => {
                tracing::debug!(error = %e, "State read after reconnect failed, will retry");
                return;
            }
        };
        self.link = Some(link);
        tracing::info!(state = ?report.state, "Link re-established");

        self.apply_report(&report);
        match self.recovery.on_reconnected(&report) {
            RecoveryStep::Complete => self.finish_recovery().await,
            RecoveryStep::Waiting => {
                tracing::info!("Waiting for firmware calibration to finish");
            }
        }
    }

    async fn check_calibration(&mut self) {
        let outcome = match self.link.as_mut() {
            Some(link) => self.transport.read_state(link).await,
            None => Err(TransportError::Disconnected),
        };

        match outcome {
            Ok(report) => {
                self.apply_report(&report);
                if self.recovery.on_wait_report(&report) == RecoveryStep::Complete {
                    self.finish_recovery().await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Lost link while waiting for calibration");
                self.recovery.on_wait_failure();
            }
        }
    }

    async fn finish_recovery(&mut self) {
        let elapsed = self.recovery.elapsed(Instant::now());
        self.recovery.reset();
        self.scheduler.reset_in_flight();
        self.health.reset();
        self.cache.target_slot = 0;
        tracing::info!(elapsed = ?elapsed, slots = self.cache.total_slots, "Recovery complete");
        self.events.push(SessionEvent::RecoveryComplete);

        self.process_queue().await;
    }

    fn give_up(&mut self) {
        tracing::error!(
            timeout = ?self.config.recovery.timeout,
            "Recovery timed out; manual intervention required"
        );
        self.recovery.reset();
        self.failed = true;
        self.scheduler.clear();
        self.cache.target_slot = 0;
        self.cache.invalidate_position();
        self.link = None;
        self.events.push(SessionEvent::RecoveryFailed);
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Link health as shown to the host.
    pub fn health(&self) -> LinkHealth {
        if self.failed {
            LinkHealth::Failed
        } else if self.recovery.is_active() {
            LinkHealth::Recovering
        } else if self.health.backoff() {
            LinkHealth::Backoff
        } else {
            LinkHealth::Ok
        }
    }

    fn next_delay(&self) -> Duration {
        let poll = &self.config.poll;
        if self.failed {
            return poll.recovery;
        }
        if self.recovery.is_active() {
            // Land exactly on the recovery deadline
            let now = Instant::now();
            return self
                .recovery
                .deadline()
                .map(|d| d.saturating_duration_since(now).min(poll.recovery))
                .unwrap_or(poll.recovery);
        }
        poll_delay(poll, self.health.backoff(), self.cache.fw_state)
    }

    fn result(&mut self) -> PollResult {
        PollResult {
            state: self.cache.fw_state,
            current_slot: self.cache.current_slot,
            last_known_slot: self.cache.last_known_slot,
            total_slots: self.cache.total_slots,
            next_delay: self.next_delay(),
            recovery: self.recovery.state(),
            health: self.health(),
            events: std::mem::take(&mut self.events),
        }
    }
}
