//! Multi-device BLE telemetry pipeline for wearable posture sensors.
//!
//! This crate connects to a set of SensorTag-style GATT peripherals worn on
//! the neck, back and shoulders, decodes their notification streams and
//! assembles aligned multi-device rows or live records.
//!
//! # Features
//!
//! - **Device sessions**: connect, enable sensors, decode notifications
//! - **Readiness barrier**: no output until every device has a live sample
//! - **Aggregation**: fixed-width CSV rows (export) or JSON + merged records (live)
//! - **Supervision**: any single-device failure restarts the whole cohort
//! - **Indicator feedback**: drive the LED/buzzer from a shared warning flag
//!
//! # Architecture
//!
//! ```text
//! BLE notifications -> DeviceSession (decode, latest snapshot, set flag)
//!                   -> ReadinessBarrier (fan-in)
//!                   -> AggregationPipeline (sample, emit)
//!                   -> RowSink / JsonFileSink / RecordPublisher
//! ```
//!
//! The [`Supervisor`] owns every task of a cohort under one cancellation
//! token and is the only component that starts or stops them.
//!
//! # Platform Differences
//!
//! On Linux and Windows devices are identified by their MAC address. On
//! macOS CoreBluetooth hides the MAC and reports a per-host UUID instead;
//! configure that UUID as the device address there.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use posture_core::pipeline::{ExportSettings, PipelineMode};
//! use posture_core::sink::{CsvSink, shared};
//! use posture_core::{BleTransport, DeviceSpec, Supervisor, SupervisorConfig};
//! use posture_types::{DeviceIdentity, Role, SensorSet};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devices = vec![
//!         DeviceSpec::new(DeviceIdentity::new("54:6C:0E:53:3B:0A", Role::Neck), SensorSet::default()),
//!         DeviceSpec::new(DeviceIdentity::new("54:6C:0E:52:F3:D1", Role::BackMid), SensorSet::default()),
//!     ];
//!     let columns = posture_core::pipeline::RowLayout::new(
//!         devices.iter().map(|d| (d.identity.role, &d.sensors)),
//!         10,
//!     )
//!     .columns();
//!
//!     let mode = PipelineMode::Export(ExportSettings {
//!         duration: Duration::from_secs(60),
//!         label: Some("upright".into()),
//!         samples_per_row: 10,
//!         sample_interval: Duration::from_millis(500),
//!         sink: shared(CsvSink::open("posture.csv", &columns)?),
//!     });
//!
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let supervisor = Supervisor::new(transport, devices, SupervisorConfig::default(), mode)?;
//!     supervisor.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod barrier;
pub mod ble;
pub mod error;
pub mod events;
pub mod feedback;
pub mod mock;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod transport;
pub mod util;

// Core exports
pub use barrier::ReadinessBarrier;
pub use ble::{BleConnection, BleTransport, get_adapter};
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
pub use events::{CohortEvent, EventDispatcher, EventReceiver, EventSender};
pub use feedback::{WarningFlag, parse_warning_payload};
pub use mock::{MemoryPublisher, MemorySink, MockPeripheral, MockTransport};
pub use pipeline::{AggregationPipeline, DeviceFeed, PipelineMode, RowLayout};
pub use session::{DeviceSession, DeviceSnapshot, SessionConfig, SessionState, SessionStats};
pub use sink::{AggregatedRow, CsvSink, JsonFileSink, RecordPublisher, RowSink, SinkError};
pub use supervisor::{DeviceSpec, Supervisor, SupervisorConfig};
pub use transport::{GattConnection, GattTransport, Notification};
pub use util::addresses_match;

// Re-export from posture-types
pub use posture_types::ble as uuids;
pub use posture_types::{DeviceIdentity, IndicatorCode, Reading, Role, SensorSet, SensorVariant};
