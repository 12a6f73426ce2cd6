//! Tunable protocol settings, loadable from TOML.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! [bus]
//! command_timeout_ms = 80
//! ping_window_ms = 1100
//!
//! [clock]
//! ack_timeout_ms = 2000
//! resend_on_error = true
//!
//! [board]
//! hysteresis_cells = 2
//! change_log_capacity = 1024
//! ```
//!
//! The crate never reads files or the environment; callers pass the text in.

use std::time::Duration;

use crate::domain::board::{DEFAULT_CHANGE_LOG_CAPACITY, DEFAULT_HYSTERESIS_CELLS};
use crate::protocol::bus::RetryPolicy;
use crate::protocol::frame::{DEFAULT_MAX_BUFFERED, MAX_FRAME_LENGTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for loading and checking a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but makes no sense.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// All protocol settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub frame: FrameConfig,
}

/// Bus mode timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    /// Wait per addressed command before it counts as lost.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Window over which boards spread their broadcast ping replies.
    #[serde(default = "default_ping_window_ms")]
    pub ping_window_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_discovery_rounds")]
    pub discovery_rounds: u32,
}

/// Clock command gating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClockConfig {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Send a rejected clock command once more.
    #[serde(default = "default_true")]
    pub resend_on_error: bool,
}

/// Board reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardConfig {
    /// Cells that may differ from a recognised position before its tag can
    /// fire again.
    #[serde(default = "default_hysteresis_cells")]
    pub hysteresis_cells: usize,
    /// Field changes kept in the reconstructor's log; 0 disables it.
    #[serde(default = "default_change_log_capacity")]
    pub change_log_capacity: usize,
}

/// Frame decoder limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameConfig {
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_command_timeout_ms() -> u64 {
    80
}

fn default_ping_window_ms() -> u64 {
    1100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_discovery_rounds() -> u32 {
    4
}

fn default_ack_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_hysteresis_cells() -> usize {
    DEFAULT_HYSTERESIS_CELLS
}

fn default_change_log_capacity() -> usize {
    DEFAULT_CHANGE_LOG_CAPACITY
}

fn default_max_buffered_bytes() -> usize {
    DEFAULT_MAX_BUFFERED
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            ping_window_ms: default_ping_window_ms(),
            max_attempts: default_max_attempts(),
            discovery_rounds: default_discovery_rounds(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            resend_on_error: default_true(),
        }
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            hysteresis_cells: default_hysteresis_cells(),
            change_log_capacity: default_change_log_capacity(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl BusConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.command_timeout_ms),
            max_attempts: self.max_attempts,
            ping_window: Duration::from_millis(self.ping_window_ms),
            discovery_rounds: self.discovery_rounds,
        }
    }
}

impl ClockConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl ProtocolConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Invalid`] for
    /// values [`validate`](Self::validate) refuses.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ProtocolConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings the protocol cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.bus.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.command_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.frame.max_buffered_bytes < MAX_FRAME_LENGTH {
            return Err(ConfigError::Invalid {
                field: "frame.max_buffered_bytes",
                reason: format!("must hold one maximal frame ({MAX_FRAME_LENGTH} bytes)"),
            });
        }
        Ok(())
    }
}
