//! # Wheel Link
//!
//! Serial-link protocol core for motorized filter-wheel controllers. The crate
//! talks to a wheel over an unreliable USB-serial byte stream: it discovers
//! which wire protocol the firmware speaks, frames and validates replies in the
//! presence of debug noise, serializes commands against a device that runs one
//! operation at a time, and recovers from a physical disconnect without losing
//! a pending move.
//!
//! ## Crate Structure
//!
//! Leaf modules first:
//!
//! - **`protocol`**: opcodes, firmware states, typed requests, and the binary
//!   frame codec (`protocol::frame`).
//! - **`serial`**: the `Link` byte channel and the `PortOpener` seam; real
//!   hardware through `tokio-serial` with the `serial` feature.
//! - **`transport`**: the Framed, Legacy and Text adapters behind one
//!   `exchange` contract, with retry.
//! - **`negotiator`**: protocol probing in preference order, plus the periodic
//!   upgrade back to Framed.
//! - **`slots`**: 0-based firmware position to 1-based slot mapping, clamping,
//!   and filter names.
//! - **`state`**: the device state cache.
//! - **`scheduler`**: single-in-flight gate with a small FIFO.
//! - **`recovery`**: link recovery state machine.
//! - **`poll`**: poll cadence and communication health.
//! - **`session`**: ties everything together; `Session::poll` is the tick.
//! - **`driver`**: a tokio task running the tick loop behind a handle.
//! - **`mock`**: simulated firmware for tests and demos.
//! - **`config`**, **`error`**, **`logging`**: ambient plumbing.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wheel_link::{LinkConfig, Session, WheelDriver};
//! use wheel_link::serial::SerialOpener;
//!
//! let config = LinkConfig::load()?;
//! wheel_link::logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
//!
//! let opener = SerialOpener::from_config(&config.port);
//! let session = Session::connect(opener, config).await?;
//! let wheel = WheelDriver::spawn(session);
//!
//! wheel.request_slot(3).await?;
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mock;
pub mod negotiator;
pub mod poll;
pub mod protocol;
pub mod recovery;
pub mod scheduler;
pub mod serial;
pub mod session;
pub mod slots;
pub mod state;
pub mod transport;

pub use config::LinkConfig;
pub use driver::{WheelDriver, WheelHandle, WheelStatus};
pub use error::{CommandError, ConnectError, FrameError, TransportError};
pub use poll::LinkHealth;
pub use protocol::{FwState, Proto};
pub use recovery::RecoveryState;
pub use scheduler::QueuedCommand;
pub use session::{PollResult, RequestOutcome, Session, SessionEvent, SessionInfo};
