//! Simulator configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is
//! a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CMD_EVT_PORT: u16 = 5000;
pub const DEFAULT_TELEMETRY_PORT: u16 = 6000;
pub const DEFAULT_TELEMETRY_INTERVAL: f64 = 1.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("`{field}` must be {requirement}, got {value}")]
    OutOfRange {
        field: &'static str,
        requirement: &'static str,
        value: f64,
    },
    #[error("`host` must not be empty")]
    EmptyHost,
}

/// Timing and pressure tuning of the simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Seconds.
    pub m1_covers_close_time: f64,
    pub m1_covers_open_time: f64,
    pub cell_vents_close_time: f64,
    pub cell_vents_open_time: f64,
    /// Pa.
    pub m1_pressure: f64,
    pub m2_pressure: f64,
    pub main_pressure: f64,
    /// kg.
    pub cell_load: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            m1_covers_close_time: 20.0,
            m1_covers_open_time: 20.0,
            cell_vents_close_time: 5.0,
            cell_vents_open_time: 1.0,
            m1_pressure: 5.0,
            m2_pressure: 6.0,
            main_pressure: 10.0,
            cell_load: 100.0,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let times = [
            ("m1_covers_close_time", self.m1_covers_close_time),
            ("m1_covers_open_time", self.m1_covers_open_time),
            ("cell_vents_close_time", self.cell_vents_close_time),
            ("cell_vents_open_time", self.cell_vents_open_time),
        ];
        for (field, value) in times {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::OutOfRange {
                    field,
                    requirement: ">= 0",
                    value,
                });
            }
        }

        let positives = [
            ("m1_pressure", self.m1_pressure),
            ("m2_pressure", self.m2_pressure),
            ("main_pressure", self.main_pressure),
            ("cell_load", self.cell_load),
        ];
        for (field, value) in positives {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::OutOfRange {
                    field,
                    requirement: "> 0",
                    value,
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorConfig {
    pub host: String,
    pub cmd_evt_port: u16,
    pub telemetry_port: u16,
    /// Seconds between telemetry samples.
    pub telemetry_interval: f64,
    pub device: DeviceConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            cmd_evt_port: DEFAULT_CMD_EVT_PORT,
            telemetry_port: DEFAULT_TELEMETRY_PORT,
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
            device: DeviceConfig::default(),
        }
    }
}

impl SimulatorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if !(self.telemetry_interval.is_finite() && self.telemetry_interval > 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "telemetry_interval",
                requirement: "> 0",
                value: self.telemetry_interval,
            });
        }
        self.device.validate()
    }

    pub fn cmd_evt_addr(&self) -> String {
        format!("{}:{}", self.host, self.cmd_evt_port)
    }

    pub fn telemetry_addr(&self) -> String {
        format!("{}:{}", self.host, self.telemetry_port)
    }
}
