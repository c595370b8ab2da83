//! Host driver loop.
//!
//! [`WheelDriver::spawn`] moves a [`Session`] onto a tokio task that polls at
//! the cadence the session asks for and serves commands between ticks. The
//! session is never shared; every interaction goes through the task.
//!
//! ```text
//! WheelHandle ──mpsc──▶ driver task ──watch──▶ WheelStatus
//!                             │
//!                             └──broadcast──▶ SessionEvent
//! ```

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::error::CommandError;
use crate::poll::LinkHealth;
use crate::protocol::{FwState, Proto};
use crate::recovery::RecoveryState;
use crate::serial::PortOpener;
use crate::session::{RequestOutcome, Session, SessionEvent};

const COMMAND_CHANNEL_DEPTH: usize = 16;
const EVENT_CHANNEL_DEPTH: usize = 64;

/// Snapshot published after every tick and command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WheelStatus {
    /// Active protocol.
    pub proto: Proto,
    /// Last observed firmware state.
    pub state: FwState,
    /// Slot from the latest read; `0` if unknown.
    pub current_slot: i32,
    /// Last valid slot observed.
    pub last_known_slot: i32,
    /// Slot count; `0` if unknown.
    pub total_slots: i32,
    /// Recovery state.
    pub recovery: RecoveryState,
    /// Link health.
    pub health: LinkHealth,
    /// Commands waiting for the device.
    pub queued: usize,
}

impl WheelStatus {
    fn from_session<O: PortOpener>(session: &Session<O>) -> Self {
        let cache = session.device_state();
        Self {
            proto: session.info().proto,
            state: cache.fw_state,
            current_slot: cache.current_slot,
            last_known_slot: cache.last_known_slot,
            total_slots: cache.total_slots,
            recovery: session.recovery_state(),
            health: session.health(),
            queued: session.scheduler().len(),
        }
    }
}

enum DriverCommand {
    RequestSlot {
        slot: i32,
        reply: oneshot::Sender<Result<RequestOutcome, CommandError>>,
    },
    SetFilterName {
        slot: i32,
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Spawns the driver task.
#[derive(Debug, Clone, Copy, Default)]
pub struct WheelDriver;

impl WheelDriver {
    /// Start polling `session` on a new task.
    pub fn spawn<O>(session: Session<O>) -> WheelHandle<O>
    where
        O: PortOpener + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (status_tx, status_rx) = watch::channel(WheelStatus::from_session(&session));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);

        let task = tokio::spawn(run(session, cmd_rx, status_tx, event_tx.clone()));

        WheelHandle {
            cmd_tx,
            status_rx,
            event_tx,
            task,
        }
    }
}

/// Handle to a running driver task.
#[derive(Debug)]
pub struct WheelHandle<O> {
    cmd_tx: mpsc::Sender<DriverCommand>,
    status_rx: watch::Receiver<WheelStatus>,
    event_tx: broadcast::Sender<SessionEvent>,
    task: JoinHandle<O>,
}

impl<O> WheelHandle<O> {
    /// Request a slot; `0` calibrates.
    pub async fn request_slot(&self, slot: i32) -> Result<RequestOutcome, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCommand::RequestSlot { slot, reply })
            .await
            .map_err(|_| CommandError::NotRunning)?;
        rx.await.map_err(|_| CommandError::NotRunning)?
    }

    /// Rename a 1-based slot.
    pub async fn set_filter_name(&self, slot: i32, name: impl Into<String>) -> Result<bool, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCommand::SetFilterName {
                slot,
                name: name.into(),
                reply,
            })
            .await
            .map_err(|_| CommandError::NotRunning)?;
        rx.await.map_err(|_| CommandError::NotRunning)
    }

    /// Latest status.
    pub fn status(&self) -> WheelStatus {
        self.status_rx.borrow().clone()
    }

    /// Status stream.
    pub fn watch_status(&self) -> watch::Receiver<WheelStatus> {
        self.status_rx.clone()
    }

    /// Event stream. Events before subscription are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the task, close the port and return the opener.
    pub async fn shutdown(self) -> Result<O, CommandError> {
        // A closed channel means the task is already on its way out
        let _ = self.cmd_tx.send(DriverCommand::Shutdown).await;
        self.task.await.map_err(|e| {
            tracing::error!(error = %e, "Wheel driver task failed");
            CommandError::NotRunning
        })
    }
}

async fn run<O: PortOpener>(
    mut session: Session<O>,
    mut cmd_rx: mpsc::Receiver<DriverCommand>,
    status_tx: watch::Sender<WheelStatus>,
    event_tx: broadcast::Sender<SessionEvent>,
) -> O {
    tracing::info!(proto = %session.info().proto, "Wheel driver started");

    let tick = sleep(Duration::ZERO);
    tokio::pin!(tick);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(DriverCommand::RequestSlot { slot, reply }) => {
                        let outcome = session.request_slot(slot).await;
                        let _ = reply.send(outcome);
                    }
                    Some(DriverCommand::SetFilterName { slot, name, reply }) => {
                        let _ = reply.send(session.set_filter_name(slot, name));
                    }
                    Some(DriverCommand::Shutdown) | None => break,
                }
                status_tx.send_replace(WheelStatus::from_session(&session));
            }
            () = &mut tick => {
                let result = session.poll().await;
                for event in &result.events {
                    // No subscribers is fine
                    let _ = event_tx.send(event.clone());
                }
                status_tx.send_replace(WheelStatus::from_session(&session));
                tick.as_mut().reset(Instant::now() + result.next_delay);
            }
        }
    }

    tracing::info!("Wheel driver stopping");
    session.disconnect().await
}
