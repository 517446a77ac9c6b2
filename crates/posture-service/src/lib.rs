//! Supervised capture service for SensorTag posture rigs.
//!
//! This crate provides a service that:
//! - Connects to every configured device and restarts the whole cohort on
//!   any single failure
//! - Appends labelled, fixed-width training rows to a CSV file (export mode)
//! - Writes per-device JSON and publishes merged records over MQTT (live mode)
//! - Drives the LED/buzzer of indicator devices from an MQTT warning topic
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/posture/config.toml`:
//!
//! ```toml
//! [[devices]]
//! address = "54:6C:0E:53:3B:0A"
//! role = "neck"
//! indicator = true
//!
//! [[devices]]
//! address = "54:6C:0E:52:F3:D1"
//! role = "back-mid"
//! sensors = ["accelerometer", "gyroscope", "magnetometer"]
//!
//! [supervisor]
//! connect_timeout_secs = 15
//! backoff_secs = 5
//!
//! [export]
//! csv_path = "posture.csv"
//! samples_per_row = 10
//! sample_interval_ms = 500
//!
//! [live]
//! json_dir = "live"
//! warning_code = 5  # red LED + buzzer
//!
//! [mqtt]
//! broker = "mqtt://localhost:1883"
//! topic = "posture/live"
//! warning_topic = "posture/warning"
//! ```
//!
//! Command line flags (`export --label --duration`, `live --broker`) override
//! the file; `POSTURE_BROKER` feeds `--broker`.

pub mod collector;
pub mod config;
pub mod mqtt;

pub use collector::{Collector, CollectorError};
pub use config::{
    Config, ConfigError, DeviceConfig, ExportConfig, LiveConfig, MqttConfig, RunMode,
    SupervisorSection, ValidationError,
};
pub use mqtt::{MqttError, MqttPublisher};
