//! Layered configuration for the control core.
//!
//! Settings load from an optional TOML file plus `RF_LINK_*` environment
//! overrides via the `config` crate. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration:
//!
//! ```toml
//! [serial]
//! baud_rate = 115200
//! parity = "none"
//! timeout_ms = 1000
//!
//! [link]
//! command_queue_capacity = 64
//! response_timeout_ms = 250
//! read_tick_ms = 5
//!
//! [poll]
//! interval_ms = 1000
//! miss_threshold = 3
//!
//! [sweep]
//! min_dwell_ms = 20
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::RfResult;
use crate::transport::serial::SerialConfig;

/// Top-level settings for a device session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub link: LinkSettings,

    #[serde(default)]
    pub poll: PollSettings,

    #[serde(default)]
    pub sweep: SweepSettings,
}

/// Session supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Capacity of the GUI-facing command queue. A full queue surfaces
    /// `Backpressure` to the producer instead of blocking it.
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// Per-request deadline. An unanswered request resolves as a timeout
    /// after this long; it never blocks the control loop indefinitely.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// How often the control loop drains the transport for inbound bytes.
    #[serde(default = "default_read_tick_ms")]
    pub read_tick_ms: u64,
}

/// Status poll pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    /// Idle time between a poll response arriving and the next poll being
    /// issued. Pacing is measured from the response, not a wall-clock timer.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive unanswered polls before the session is marked Degraded.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
}

/// Sweep engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Firmware-enforced minimum dwell. Shorter requested dwells are clamped
    /// up so status polling is never starved between steps.
    #[serde(default = "default_min_dwell_ms")]
    pub min_dwell_ms: u64,
}

fn default_command_queue_capacity() -> usize {
    64
}

fn default_response_timeout_ms() -> u64 {
    250
}

fn default_read_tick_ms() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_min_dwell_ms() -> u64 {
    20
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            command_queue_capacity: default_command_queue_capacity(),
            response_timeout_ms: default_response_timeout_ms(),
            read_tick_ms: default_read_tick_ms(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            miss_threshold: default_miss_threshold(),
        }
    }
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            min_dwell_ms: default_min_dwell_ms(),
        }
    }
}

impl Settings {
    /// Loads settings from a TOML file, with `RF_LINK_*` environment
    /// variables layered on top (e.g. `RF_LINK_POLL__INTERVAL_MS=500`).
    pub fn from_path(path: &Path) -> RfResult<Self> {
        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("RF_LINK").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.link.response_timeout_ms)
    }

    pub fn read_tick(&self) -> Duration {
        Duration::from_millis(self.link.read_tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn min_dwell(&self) -> Duration {
        Duration::from_millis(self.sweep.min_dwell_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.link.command_queue_capacity, 64);
        assert_eq!(settings.poll.miss_threshold, 3);
        assert_eq!(settings.min_dwell(), Duration::from_millis(20));
    }

    #[test]
    fn test_from_path_partial_file() {
        let file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        std::fs::write(
            file.path(),
            r#"
[poll]
interval_ms = 250
miss_threshold = 5

[serial]
baud_rate = 9600
"#,
        )
        .unwrap();

        let settings = Settings::from_path(file.path()).unwrap();
        assert_eq!(settings.poll.interval_ms, 250);
        assert_eq!(settings.poll.miss_threshold, 5);
        assert_eq!(settings.serial.baud_rate, 9600);
        // Untouched sections keep their defaults.
        assert_eq!(settings.link.response_timeout_ms, 250);
        assert_eq!(settings.sweep.min_dwell_ms, 20);
    }
}
