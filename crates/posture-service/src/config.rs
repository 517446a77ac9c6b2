//! Service configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use posture_core::pipeline::RowLayout;
use posture_core::{DeviceSpec, SupervisorConfig, addresses_match};
use posture_types::{DeviceIdentity, IndicatorCode, Role, SensorSet, SensorVariant};

use crate::mqtt::parse_broker_url;

/// Which pipeline the service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Fixed-width labelled rows appended to a CSV file.
    Export,
    /// Per-device JSON files plus merged MQTT records.
    Live,
}

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Devices worn by the subject.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Supervision timing.
    pub supervisor: SupervisorSection,
    /// Export mode settings.
    pub export: ExportConfig,
    /// Live mode settings.
    pub live: LiveConfig,
    /// MQTT broker settings (live mode only).
    pub mqtt: MqttConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration for the given mode.
    ///
    /// This checks:
    /// - At least one device is configured
    /// - Every role and sensor name is known
    /// - No two devices share an address or a role
    /// - No device enables both barometer and quaternion
    /// - Every interval is positive and `samples_per_row` is at least 1
    /// - In live mode, the broker URL parses
    pub fn validate(&self, mode: RunMode) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.devices.is_empty() {
            errors.push(ValidationError {
                field: "devices".to_string(),
                message: "at least one device must be configured".to_string(),
            });
        }

        let mut seen_addresses: Vec<&str> = Vec::new();
        let mut seen_roles = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if seen_addresses
                .iter()
                .any(|seen| addresses_match(seen, &device.address))
            {
                errors.push(ValidationError {
                    field: format!("{}.address", prefix),
                    message: format!("duplicate device address '{}'", device.address),
                });
            }
            seen_addresses.push(&device.address);

            if let Ok(role) = device.role.parse::<Role>()
                && !seen_roles.insert(role)
            {
                errors.push(ValidationError {
                    field: format!("{}.role", prefix),
                    message: format!("role '{}' is assigned to more than one device", role),
                });
            }
        }

        errors.extend(self.supervisor.validate());
        match mode {
            RunMode::Export => errors.extend(self.export.validate()),
            RunMode::Live => {
                errors.extend(self.live.validate());
                errors.extend(self.mqtt.validate());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P, mode: RunMode) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate(mode)?;
        Ok(config)
    }

    /// The devices as supervisor input.
    ///
    /// Fails with the same errors as [`Config::validate`] for any device
    /// whose role or sensors do not parse.
    pub fn device_specs(&self) -> Result<Vec<DeviceSpec>, ConfigError> {
        let mut specs = Vec::with_capacity(self.devices.len());
        let mut errors = Vec::new();
        for (i, device) in self.devices.iter().enumerate() {
            match device.to_spec() {
                Ok(spec) => specs.push(spec),
                Err(_) => errors.extend(device.validate(&format!("devices[{}]", i))),
            }
        }
        if errors.is_empty() {
            Ok(specs)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Column names of an export row for the configured devices.
    ///
    /// A pure function of the device list and `samples_per_row`, so an
    /// existing CSV file can be checked before any device is contacted.
    pub fn export_columns(&self) -> Result<Vec<String>, ConfigError> {
        let specs = self.device_specs()?;
        Ok(RowLayout::new(
            specs.iter().map(|d| (d.identity.role, &d.sensors)),
            self.export.samples_per_row,
        )
        .columns())
    }

    /// Timing and indicator settings for the supervisor.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: Duration::from_secs(self.supervisor.connect_timeout_secs),
            liveness_interval: Duration::from_millis(self.supervisor.liveness_interval_ms),
            backoff: Duration::from_secs(self.supervisor.backoff_secs),
            scan_window: Duration::from_secs(self.supervisor.scan_secs),
            warning_code: IndicatorCode::try_from(self.live.warning_code)
                .unwrap_or(IndicatorCode::RedBuzzer),
        }
    }
}

/// Configuration for one worn device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// BLE address (CoreBluetooth UUID on macOS).
    pub address: String,
    /// Wearing position, e.g. `neck` or `back-mid`.
    pub role: String,
    /// Sensors to enable.
    #[serde(default = "default_sensors")]
    pub sensors: Vec<String>,
    /// Drive the LED/buzzer from the warning flag.
    #[serde(default)]
    pub indicator: bool,
}

fn default_sensors() -> Vec<String> {
    SensorSet::default()
        .iter()
        .map(|variant| variant.as_str().to_string())
        .collect()
}

impl DeviceConfig {
    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.address.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.address", prefix),
                message: "device address cannot be empty".to_string(),
            });
        }

        if let Err(e) = self.role.parse::<Role>() {
            errors.push(ValidationError {
                field: format!("{}.role", prefix),
                message: e.to_string(),
            });
        }

        let mut variants = Vec::new();
        let mut names_ok = true;
        for name in &self.sensors {
            match name.parse::<SensorVariant>() {
                Ok(variant) => variants.push(variant),
                Err(e) => {
                    names_ok = false;
                    errors.push(ValidationError {
                        field: format!("{}.sensors", prefix),
                        message: e.to_string(),
                    });
                }
            }
        }
        if names_ok && let Err(e) = SensorSet::new(variants) {
            errors.push(ValidationError {
                field: format!("{}.sensors", prefix),
                message: e.to_string(),
            });
        }

        errors
    }

    /// Convert to a supervisor device.
    pub fn to_spec(&self) -> Result<DeviceSpec, String> {
        let role: Role = self.role.parse().map_err(|e| format!("{}", e))?;
        let variants = self
            .sensors
            .iter()
            .map(|name| name.parse::<SensorVariant>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        let sensors = SensorSet::new(variants).map_err(|e| e.to_string())?;

        let spec = DeviceSpec::new(DeviceIdentity::new(self.address.trim(), role), sensors);
        Ok(if self.indicator {
            spec.with_indicator()
        } else {
            spec
        })
    }
}

/// Supervision timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Connect budget per device in seconds.
    pub connect_timeout_secs: u64,
    /// Liveness polling interval in milliseconds.
    pub liveness_interval_ms: u64,
    /// Wait between a cohort failure and the next attempt in seconds.
    pub backoff_secs: u64,
    /// Scan window per discovery attempt in seconds.
    pub scan_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            liveness_interval_ms: 1000,
            backoff_secs: 5,
            scan_secs: 5,
        }
    }
}

impl SupervisorSection {
    /// Validate supervision timing.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("liveness_interval_ms", self.liveness_interval_ms),
            ("backoff_secs", self.backoff_secs),
            ("scan_secs", self.scan_secs),
        ] {
            if value == 0 {
                errors.push(positive(format!("supervisor.{}", field)));
            }
        }
        errors
    }
}

/// Export mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// CSV file rows are appended to.
    pub csv_path: PathBuf,
    /// Classification label written with every row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Total run time in seconds.
    pub duration_secs: u64,
    /// Samples per row.
    pub samples_per_row: usize,
    /// Pacing between samples in milliseconds.
    pub sample_interval_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("posture.csv"),
            label: None,
            duration_secs: 60,
            samples_per_row: posture_core::pipeline::DEFAULT_SAMPLES_PER_ROW,
            sample_interval_ms: 500,
        }
    }
}

impl ExportConfig {
    /// Validate export settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.csv_path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "export.csv_path".to_string(),
                message: "CSV path cannot be empty".to_string(),
            });
        }
        if let Some(label) = &self.label
            && label.is_empty()
        {
            errors.push(ValidationError {
                field: "export.label".to_string(),
                message: "label cannot be empty string (omit it instead)".to_string(),
            });
        }
        if self.duration_secs == 0 {
            errors.push(positive("export.duration_secs".to_string()));
        }
        if self.samples_per_row == 0 {
            errors.push(ValidationError {
                field: "export.samples_per_row".to_string(),
                message: "at least one sample per row is required".to_string(),
            });
        }
        if self.sample_interval_ms == 0 {
            errors.push(positive("export.sample_interval_ms".to_string()));
        }

        errors
    }
}

/// Live mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Directory of the per-device JSON files.
    pub json_dir: PathBuf,
    /// How often snapshots are checked in milliseconds.
    pub publish_interval_ms: u64,
    /// Indicator code (0-7) shown while the warning is active.
    pub warning_code: u8,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            json_dir: PathBuf::from("live"),
            publish_interval_ms: 1000,
            warning_code: IndicatorCode::RedBuzzer.as_byte(),
        }
    }
}

impl LiveConfig {
    /// Validate live settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.json_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "live.json_dir".to_string(),
                message: "JSON directory cannot be empty".to_string(),
            });
        }
        if self.publish_interval_ms == 0 {
            errors.push(positive("live.publish_interval_ms".to_string()));
        }
        if let Err(e) = IndicatorCode::try_from(self.warning_code) {
            errors.push(ValidationError {
                field: "live.warning_code".to_string(),
                message: e.to_string(),
            });
        }

        errors
    }
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL (`mqtt://host:port` or `mqtts://host:port`).
    pub broker: String,
    /// Topic merged records are published to.
    pub topic: String,
    /// Topic carrying the posture warning state, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_topic: Option<String>,
    /// Client ID.
    pub client_id: String,
    /// Quality of service (0, 1 or 2).
    pub qos: u8,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    /// Username, if the broker requires authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password, if the broker requires authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "mqtt://localhost:1883".to_string(),
            topic: "posture/live".to_string(),
            warning_topic: Some("posture/warning".to_string()),
            client_id: "posture-service".to_string(),
            qos: 1,
            keep_alive: 30,
            username: None,
            password: None,
        }
    }
}

impl MqttConfig {
    /// Validate broker settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = parse_broker_url(&self.broker) {
            errors.push(ValidationError {
                field: "mqtt.broker".to_string(),
                message: e,
            });
        }
        if self.topic.is_empty() || self.topic.contains(['#', '+']) {
            errors.push(ValidationError {
                field: "mqtt.topic".to_string(),
                message: format!("invalid publish topic '{}'", self.topic),
            });
        }
        if let Some(topic) = &self.warning_topic
            && topic.is_empty()
        {
            errors.push(ValidationError {
                field: "mqtt.warning_topic".to_string(),
                message: "warning topic cannot be empty string (omit it instead)".to_string(),
            });
        }
        if self.client_id.is_empty() {
            errors.push(ValidationError {
                field: "mqtt.client_id".to_string(),
                message: "client ID cannot be empty".to_string(),
            });
        }
        if self.qos > 2 {
            errors.push(ValidationError {
                field: "mqtt.qos".to_string(),
                message: format!("QoS {} is invalid (must be 0, 1 or 2)", self.qos),
            });
        }
        if self.keep_alive == 0 {
            errors.push(positive("mqtt.keep_alive".to_string()));
        }

        errors
    }
}

fn positive(field: String) -> ValidationError {
    ValidationError {
        field,
        message: "must be greater than zero".to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `export.duration_secs` or `devices[0].role`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("posture")
        .join("config.toml")
}
