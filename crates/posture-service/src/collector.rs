//! Runs the supervised device cohort for one service mode.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use posture_core::pipeline::{ExportSettings, LiveSettings, PipelineMode};
use posture_core::sink::{CsvSink, JsonFileSink, SinkError, shared};
use posture_core::{
    CohortEvent, DeviceSpec, EventDispatcher, EventReceiver, GattTransport, RecordPublisher,
    Supervisor, WarningFlag,
};

use crate::config::{Config, ConfigError, RunMode};
use crate::mqtt::{MqttError, MqttPublisher};

/// Capacity of the cohort event channel.
const EVENT_CAPACITY: usize = 256;

/// Drives one [`Supervisor`] from the service configuration.
pub struct Collector {
    config: Config,
    transport: Arc<dyn GattTransport>,
    events: EventDispatcher,
    warning: WarningFlag,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("devices", &self.config.devices.len())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Create a collector over `transport`.
    pub fn new(config: Config, transport: Arc<dyn GattTransport>) -> Self {
        Self {
            config,
            transport,
            events: EventDispatcher::new(EVENT_CAPACITY),
            warning: WarningFlag::new(),
        }
    }

    /// Cohort events of every run.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Warning flag shared with the indicator devices.
    pub fn warning_flag(&self) -> WarningFlag {
        self.warning.clone()
    }

    /// Append labelled rows to the CSV file until the duration elapses or
    /// `shutdown` fires.
    ///
    /// The CSV header is checked before any device is contacted.
    pub async fn run_export(&self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        self.config.validate(RunMode::Export)?;
        let export = &self.config.export;
        let columns = self.config.export_columns()?;
        let sink = CsvSink::open(&export.csv_path, &columns)?;
        info!(
            "Exporting {} columns to {} for {}s (label: {})",
            columns.len(),
            export.csv_path.display(),
            export.duration_secs,
            export.label.as_deref().unwrap_or("-")
        );

        let mode = PipelineMode::Export(ExportSettings {
            duration: Duration::from_secs(export.duration_secs),
            label: export.label.clone(),
            samples_per_row: export.samples_per_row,
            sample_interval: Duration::from_millis(export.sample_interval_ms),
            sink: shared(sink),
        });
        self.supervise(mode, shutdown).await
    }

    /// Write per-device JSON and publish merged records over MQTT until
    /// `shutdown` fires.
    pub async fn run_live(&self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        self.config.validate(RunMode::Live)?;
        let mqtt_cancel = CancellationToken::new();
        let (publisher, event_loop) =
            MqttPublisher::connect(&self.config.mqtt, self.warning.clone(), mqtt_cancel.clone())?;

        let result = self
            .run_live_with(Arc::new(publisher.clone()), shutdown)
            .await;

        publisher.disconnect().await;
        mqtt_cancel.cancel();
        if let Err(e) = event_loop.await {
            debug!("MQTT event loop task ended abnormally: {}", e);
        }
        result
    }

    /// Live mode with an arbitrary record publisher.
    pub async fn run_live_with(
        &self,
        publisher: Arc<dyn RecordPublisher>,
        shutdown: CancellationToken,
    ) -> Result<(), CollectorError> {
        let live = &self.config.live;
        info!("Writing live JSON to {}", live.json_dir.display());

        let mode = PipelineMode::Live(LiveSettings {
            publish_interval: Duration::from_millis(live.publish_interval_ms),
            json: JsonFileSink::new(&live.json_dir),
            publisher,
        });
        self.supervise(mode, shutdown).await
    }

    async fn supervise(
        &self,
        mode: PipelineMode,
        shutdown: CancellationToken,
    ) -> Result<(), CollectorError> {
        let devices: Vec<DeviceSpec> = self.config.device_specs()?;
        let supervisor = Supervisor::new(
            Arc::clone(&self.transport),
            devices,
            self.config.supervisor_config(),
            mode,
        )?
        .with_events(self.events.clone())
        .with_warning_flag(self.warning.clone());

        let status = tokio::spawn(log_status(self.events.subscribe()));
        let result = supervisor.run(shutdown).await;
        status.abort();
        result.map_err(CollectorError::from)
    }
}

/// Log cohort progress for the operator.
async fn log_status(mut events: EventReceiver) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(CohortEvent::CohortReady { generation }) => {
                info!("All devices streaming (cohort {})", generation);
            }
            Ok(CohortEvent::RowEmitted { rows }) if rows % 10 == 0 => {
                info!("{} rows written", rows);
            }
            Ok(CohortEvent::Finished) => break,
            Ok(event) => debug!("{:?}", event),
            Err(RecvError::Lagged(n)) => warn!("Status display lagged, missed {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Collector errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Output error: {0}")]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Mqtt(#[from] MqttError),
    #[error(transparent)]
    Core(#[from] posture_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use posture_core::{MemoryPublisher, MockTransport};
    use posture_types::ble;

    const NECK: &str = "54:6C:0E:53:3B:0A";
    const BACK: &str = "54:6C:0E:52:F3:D1";

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config {
            devices: vec![
                DeviceConfig {
                    address: NECK.to_string(),
                    role: "neck".to_string(),
                    sensors: vec!["accelerometer".to_string()],
                    indicator: false,
                },
                DeviceConfig {
                    address: BACK.to_string(),
                    role: "back-mid".to_string(),
                    sensors: vec!["accelerometer".to_string()],
                    indicator: false,
                },
            ],
            ..Config::default()
        };
        config.supervisor.liveness_interval_ms = 200;
        config.supervisor.scan_secs = 1;
        config.export.csv_path = dir.join("rows.csv");
        config.export.label = Some("upright".to_string());
        config.export.duration_secs = 10;
        config.export.samples_per_row = 2;
        config.live.json_dir = dir.join("live");
        config.live.publish_interval_ms = 250;
        config
    }

    fn transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        let payload: Vec<u8> = [0i16, 0, 0, 8192, 0, 0, 0, 0, 0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        for address in [NECK, BACK] {
            transport
                .add(address)
                .feed(ble::MOTION_DATA, payload.clone(), Duration::from_millis(100));
        }
        transport
    }

    #[test]
    fn test_export_columns() {
        let dir = tempfile::tempdir().unwrap();
        let columns = config(dir.path()).export_columns().unwrap();
        assert_eq!(columns.len(), 12);
        assert_eq!(columns[0], "acc_x_neck_0");
        assert_eq!(columns[11], "acc_z_back_mid_1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_export_writes_labelled_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let csv_path = config.export.csv_path.clone();
        let collector = Collector::new(config, transport());

        collector.run_export(CancellationToken::new()).await.unwrap();

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 14);
        assert_eq!(&headers[0], "timestamp");
        assert_eq!(&headers[13], "label");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| &r[13] == "upright"));
        assert_eq!(rows[0][1].parse::<f64>().unwrap(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_export_rejects_foreign_csv() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.export.csv_path, "timestamp,co2,label\n").unwrap();
        let mock = transport();
        let collector = Collector::new(config, mock.clone());

        let result = collector.run_export(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(CollectorError::Sink(SinkError::SchemaMismatch { .. }))
        ));
        let neck = mock.peripheral(NECK).unwrap();
        assert_eq!(neck.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_export_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.devices[1].role = "neck".to_string();
        let collector = Collector::new(config, transport());

        let result = collector.run_export(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(CollectorError::Config(ConfigError::Validation(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_live_publishes_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let json_dir = config.live.json_dir.clone();
        let collector = Collector::new(config, transport());
        let publisher = MemoryPublisher::new();

        let shutdown = CancellationToken::new();
        let mut events = collector.events().subscribe();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, CohortEvent::Published { records } if records >= 3) {
                    stopper.cancel();
                    break;
                }
            }
        });

        collector
            .run_live_with(Arc::new(publisher.clone()), shutdown)
            .await
            .unwrap();

        let records = publisher.records();
        assert!(records.len() >= 3);
        assert!(records[0].contains_key("acc_x_neck"));
        assert!(records[0].contains_key("acc_z_back_mid"));
        assert!(json_dir.join("neck.json").exists());
        assert!(json_dir.join("back_mid.json").exists());
    }
}
