//! Process configuration loading.
//!
//! TOML-backed configuration for the sequence engine. Every field has a
//! default so an empty file (or [`StandConfig::default`]) yields a usable
//! configuration.
//!
//! # TOML Example
//!
//! ```toml
//! auto_abort = true
//! timer_sync_rate_hz = 10
//! state_queue_depth = 256
//! ```

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Process configuration for the sequence engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StandConfig {
    /// Whether telemetry range violations automatically abort a running
    /// sequence.
    pub auto_abort: bool,

    /// Rate of progress broadcasts to listeners [Hz]. The engine derives
    /// the per-tick progress modulus from this.
    pub timer_sync_rate_hz: i64,

    /// Capacity of the bounded state-change event queue.
    pub state_queue_depth: usize,
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            auto_abort: true,
            timer_sync_rate_hz: 10,
            state_queue_depth: 256,
        }
    }
}

impl StandConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_sync_rate_hz <= 0 {
            return Err(ConfigError::Validation(format!(
                "timer_sync_rate_hz must be positive, got {}",
                self.timer_sync_rate_hz
            )));
        }
        if self.state_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "state_queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Interval between progress broadcasts [µs]. A non-positive rate
    /// (rejected by [`validate`](Self::validate), but reachable through a
    /// hand-built value) is clamped to 1 Hz rather than dividing by zero.
    #[inline]
    pub fn sync_interval_us(&self) -> i64 {
        1_000_000 / self.timer_sync_rate_hz.max(1)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
