//! Acquisition configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/acquisition.toml` (base configuration)
//! 2. Environment variables prefixed with `TELEMETRY_DAQ_`, nested keys separated
//!    by a double underscore (`TELEMETRY_DAQ_SESSION__EXPERIMENT=run_7`)
//!
//! # Example
//! ```no_run
//! use telemetry_daq::config::AcquisitionConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcquisitionConfig::load()?;
//! config.validate()?;
//! println!("Experiment: {}", config.session.experiment);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::SampleMode;
use crate::worker::normalize;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/acquisition.toml";

/// Top-level acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session-wide acquisition settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Live-telemetry sink settings
    #[serde(default)]
    pub sink: SinkConfig,
    /// Device roster, in start order
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Session configuration shared by every worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Experiment name; part of every data log filename
    #[serde(default = "default_experiment")]
    pub experiment: String,
    /// Directory holding the per-device data logs
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Initial sample-rate mode (0 = slow, 1 = fast)
    #[serde(default)]
    pub mode: u8,
    /// Query available serial ports at startup
    #[serde(default = "default_true")]
    pub refresh_ports: bool,
}

/// Live-telemetry sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Whether records are forwarded at all
    #[serde(default)]
    pub enabled: bool,
    /// Consumer process to spawn (program followed by arguments).
    /// When empty, records are written to stdout.
    #[serde(default)]
    pub command: Vec<String>,
    /// Records buffered between workers and the pipe before new ones are dropped
    #[serde(default = "default_sink_capacity")]
    pub capacity: usize,
}

/// Hardware backend of a configured device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Serial-attached motion sensor
    Serial,
    /// Line-oriented TCP device
    Socket,
    /// Motion-capture bridge
    MotionCapture,
    /// Scripted in-process device
    Mock,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Stable device title; used for filenames and thread names
    pub title: String,
    /// Device backend
    pub r#type: DeviceType,
    /// Port path or host to connect on startup
    #[serde(default)]
    pub port: Option<String>,
    /// Poll interval in milliseconds (0 polls as fast as possible)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Whether this device is part of the session
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Echo every record as a `LogData` response
    #[serde(default)]
    pub log_to_console: bool,
    /// Forward records to the live sink
    #[serde(default = "default_true")]
    pub log_to_sink: bool,
}

// Default value functions
fn default_app_name() -> String {
    "Telemetry DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_experiment() -> String {
    "default".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_sink_capacity() -> usize {
    1024
}

fn default_interval_ms() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            experiment: default_experiment(),
            output_dir: default_output_dir(),
            mode: 0,
            refresh_ports: true,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            capacity: default_sink_capacity(),
        }
    }
}

impl AcquisitionConfig {
    /// Load configuration from `config/acquisition.toml` and environment variables
    ///
    /// Environment variables override file values with prefix `TELEMETRY_DAQ_`.
    /// Example: `TELEMETRY_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TELEMETRY_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if SampleMode::try_from(self.session.mode).is_err() {
            return Err(DaqError::Configuration(format!(
                "Invalid session mode {}. Must be 0 (slow) or 1 (fast)",
                self.session.mode
            )));
        }

        if self.session.experiment.trim().is_empty() {
            return Err(DaqError::Configuration(
                "Experiment name must not be empty".to_string(),
            ));
        }

        if self.sink.capacity == 0 {
            return Err(DaqError::Configuration(
                "Sink capacity must be at least 1".to_string(),
            ));
        }

        // Titles name data logs and threads; two titles with the same file name would share a log
        let mut titles = std::collections::HashMap::new();
        for device in &self.devices {
            if device.title.trim().is_empty() {
                return Err(DaqError::Configuration(
                    "Device title must not be empty".to_string(),
                ));
            }
            if let Some(existing) = titles.insert(normalize(&device.title), device.title.as_str()) {
                return Err(if existing == device.title {
                    DaqError::Configuration(format!("Duplicate device title: {}", device.title))
                } else {
                    DaqError::Configuration(format!(
                        "Device titles '{existing}' and '{}' map to the same data log",
                        device.title
                    ))
                });
            }
        }

        Ok(())
    }

    /// Get all enabled devices, in roster order
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|device| device.enabled).collect()
    }
}
