//! Link configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, every key optional)
//! 2. environment variables prefixed with `WHEEL_LINK_`, with `__` separating
//!    sections from keys (`WHEEL_LINK_RECOVERY__TIMEOUT=90s`)
//!
//! Durations use humantime notation (`"350ms"`, `"5m"`).
//!
//! # Example
//! ```no_run
//! use wheel_link::config::LinkConfig;
//!
//! let config = LinkConfig::load_from("config/wheel_link.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "WHEEL_LINK_";

/// Top-level link configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Physical port settings
    pub port: PortConfig,
    /// Protocol delays and response timeouts
    pub timing: TimingConfig,
    /// Poll cadence
    pub poll: PollConfig,
    /// Recovery thresholds
    pub recovery: RecoveryConfig,
    /// Command queue and retry settings
    pub scheduler: SchedulerConfig,
    /// Protocol upgrade attempts
    pub upgrade: UpgradeConfig,
    /// Logging
    pub log: LogConfig,
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Device path (e.g., "/dev/ttyACM0")
    pub device_path: String,
    /// Baud rate
    pub baud_rate: u32,
}

/// Protocol delays and response timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after opening the port before the first probe
    #[serde(with = "humantime_serde")]
    pub connect_settle: Duration,
    /// Wait after the wake-up pattern
    #[serde(with = "humantime_serde")]
    pub wake_settle: Duration,
    /// Wait between failed probes
    #[serde(with = "humantime_serde")]
    pub probe_gap: Duration,
    /// Wait after writing a framed request before reading
    #[serde(with = "humantime_serde")]
    pub framed_settle: Duration,
    /// Bound on a single read while hunting for a frame start
    #[serde(with = "humantime_serde")]
    pub frame_sync_timeout: Duration,
    /// Noise bytes tolerated before a sync attempt is restarted
    pub frame_scan_window: usize,
    /// Overall deadline for a framed reply
    #[serde(with = "humantime_serde")]
    pub framed_deadline: Duration,
    /// Legacy 8-byte reply timeout
    #[serde(with = "humantime_serde")]
    pub legacy_timeout: Duration,
    /// Text line reply timeout
    #[serde(with = "humantime_serde")]
    pub text_timeout: Duration,
    /// Window used to drain stale input on flush
    #[serde(with = "humantime_serde")]
    pub flush_window: Duration,
    /// Longest a flush keeps draining a line that never goes quiet
    #[serde(with = "humantime_serde")]
    pub flush_limit: Duration,
    /// Bytes a flush discards before giving up on a quiet line
    pub flush_max_bytes: usize,
}

/// Poll cadence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Cadence while moving or calibrating
    #[serde(with = "humantime_serde")]
    pub active: Duration,
    /// Cadence while idle
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
    /// Cadence while communication backoff is active
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Cadence during recovery
    #[serde(with = "humantime_serde")]
    pub recovery: Duration,
    /// Consecutive poll failures that activate backoff
    pub backoff_after: u32,
}

/// Recovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Give up this long after recovery started
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive poll failures that start recovery
    pub failure_threshold: u32,
    /// Wait between closing and reopening the port
    #[serde(with = "humantime_serde")]
    pub reconnect_settle: Duration,
}

/// Command scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Commands held while one is in flight
    pub queue_capacity: usize,
    /// Attempts per adapter operation
    pub retry_attempts: u32,
    /// Delay between attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

/// Protocol upgrade settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Periodically retry the framed protocol when on a fallback
    pub enabled: bool,
    /// Minimum time between attempts
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Wait after flushing before the wake-up pattern
    #[serde(with = "humantime_serde")]
    pub flush_settle: Duration,
    /// Wait after the wake-up pattern before the probe
    #[serde(with = "humantime_serde")]
    pub wake_settle: Duration,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

// Default value functions
fn default_device_path() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_settle: Duration::from_millis(500),
            wake_settle: Duration::from_millis(200),
            probe_gap: Duration::from_millis(300),
            framed_settle: Duration::from_millis(50),
            frame_sync_timeout: Duration::from_millis(500),
            frame_scan_window: 512,
            framed_deadline: Duration::from_secs(3),
            legacy_timeout: Duration::from_secs(3),
            text_timeout: Duration::from_secs(2),
            flush_window: Duration::from_millis(50),
            flush_limit: Duration::from_millis(500),
            flush_max_bytes: 4096,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            active: Duration::from_millis(150),
            idle: Duration::from_millis(200),
            backoff: Duration::from_millis(350),
            recovery: Duration::from_millis(1000),
            backoff_after: 1,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            failure_threshold: 3,
            reconnect_settle: Duration::from_secs(1),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            retry_attempts: 2,
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            flush_settle: Duration::from_millis(100),
            wake_settle: Duration::from_millis(150),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from `config/wheel_link.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/wheel_link.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(LinkConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Write this configuration as TOML
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self).context("Failed to serialize link config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write link config: {}", path.display()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.log.format,
                valid_formats.join(", ")
            ));
        }

        if self.port.device_path.is_empty() {
            return Err("port.device_path must not be empty".to_string());
        }
        if self.port.baud_rate == 0 {
            return Err("port.baud_rate must be > 0".to_string());
        }

        if self.scheduler.queue_capacity == 0 {
            return Err("scheduler.queue_capacity must be >= 1".to_string());
        }
        if self.scheduler.retry_attempts == 0 {
            return Err("scheduler.retry_attempts must be >= 1".to_string());
        }

        if self.recovery.failure_threshold == 0 {
            return Err("recovery.failure_threshold must be >= 1".to_string());
        }
        if self.recovery.timeout.is_zero() {
            return Err("recovery.timeout must be > 0".to_string());
        }

        if self.poll.backoff_after == 0 {
            return Err("poll.backoff_after must be >= 1".to_string());
        }
        if self.poll.active.is_zero() || self.poll.idle.is_zero() {
            return Err("poll cadences must be > 0".to_string());
        }
        if self.poll.active > self.poll.idle {
            return Err(format!(
                "poll.active ({:?}) must not be slower than poll.idle ({:?})",
                self.poll.active, self.poll.idle
            ));
        }

        let t = &self.timing;
        if t.framed_deadline.is_zero() || t.legacy_timeout.is_zero() || t.text_timeout.is_zero() {
            return Err("response timeouts must be > 0".to_string());
        }
        if t.frame_sync_timeout.is_zero() {
            return Err("timing.frame_sync_timeout must be > 0".to_string());
        }
        if t.frame_scan_window == 0 {
            return Err("timing.frame_scan_window must be > 0".to_string());
        }
        if t.flush_limit < t.flush_window {
            return Err(format!(
                "timing.flush_limit ({:?}) must be >= timing.flush_window ({:?})",
                t.flush_limit, t.flush_window
            ));
        }
        if t.flush_max_bytes == 0 {
            return Err("timing.flush_max_bytes must be > 0".to_string());
        }

        Ok(())
    }
}
