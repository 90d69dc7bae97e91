//! Configuration System using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/helix.toml` unless another path is given)
//! 3. Environment variables prefixed with `HELIX_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use helix_cycler::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Polling every {} ms", settings.engine.poll_interval_ms);
//! # Ok::<(), helix_cycler::error::HelixError>(())
//! ```
//!
//! `HELIX_ENGINE__POLL_INTERVAL_MS=50` overrides `engine.poll_interval_ms`.

use crate::error::{HelixError, HelixResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/helix.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub serial: SerialConfig,
    pub telemetry: TelemetryConfig,
    pub engine: EngineConfig,
    pub monitor: MonitorConfig,
    pub output: OutputConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port used when none is given on the command line
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Read/write timeout for a single line, in milliseconds
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            timeout_ms: 2_000,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Telemetry parser settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Lines read (including re-issued queries) before a query is declared unanswered
    pub max_attempts: u32,
    /// Wall-clock budget for one query, whatever attempts remain
    pub max_wait_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            max_wait_ms: 1000,
        }
    }
}

impl TelemetryConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Protocol engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_ms: u64,
    /// Remaining hold time (seconds) at or below which a timed step is complete
    pub completion_epsilon: f64,
    /// Well volume in µL sent with timed plate set-points
    pub well_volume: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            completion_epsilon: 0.001,
            well_volume: None,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Idle temperature monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_ms: 2_000 }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Where run artifacts are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub history_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            history_dir: PathBuf::from("runs"),
        }
    }
}

impl Settings {
    /// Load configuration from `config/helix.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load() -> HelixResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> HelixResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HELIX_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> HelixResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(HelixError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(HelixError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(HelixError::Config("serial.baud_rate must be > 0".into()));
        }
        if self.serial.timeout_ms == 0 {
            return Err(HelixError::Config("serial.timeout_ms must be > 0".into()));
        }
        if self.telemetry.max_attempts == 0 {
            return Err(HelixError::Config(
                "telemetry.max_attempts must be > 0".into(),
            ));
        }
        if self.telemetry.max_wait_ms == 0 {
            return Err(HelixError::Config("telemetry.max_wait_ms must be > 0".into()));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(HelixError::Config(
                "engine.poll_interval_ms must be > 0".into(),
            ));
        }
        if !(self.engine.completion_epsilon > 0.0) {
            return Err(HelixError::Config(format!(
                "engine.completion_epsilon must be positive, got {}",
                self.engine.completion_epsilon
            )));
        }
        if let Some(volume) = self.engine.well_volume {
            if !(volume > 0.0) {
                return Err(HelixError::Config(format!(
                    "engine.well_volume must be positive, got {}",
                    volume
                )));
            }
        }
        if self.monitor.interval_ms == 0 {
            return Err(HelixError::Config("monitor.interval_ms must be > 0".into()));
        }

        Ok(())
    }
}
