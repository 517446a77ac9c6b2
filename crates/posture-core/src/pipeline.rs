//! Aggregation of per-device snapshots into rows and records.
//!
//! The pipeline waits on the cohort's [`ReadinessBarrier`] and then either
//! appends fixed-width rows to a [`RowSink`](crate::sink::RowSink) (export
//! mode) or writes per-device JSON files and publishes merged records (live
//! mode). It only ever reads session snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use posture_types::{DeviceIdentity, Role, SensorSet, SensorVariant};

use crate::barrier::ReadinessBarrier;
use crate::error::Result;
use crate::events::{CohortEvent, EventDispatcher};
use crate::session::DeviceSnapshot;
use crate::sink::{AggregatedRow, JsonFileSink, RecordPublisher, SharedRowSink, SinkError};
use crate::util::bounded;

/// Key of the timestamp field in live JSON records.
pub const TIMESTAMP_KEY: &str = "Timestamp";

/// Default number of samples per export row.
pub const DEFAULT_SAMPLES_PER_ROW: usize = 10;

/// Default pacing between export samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Default live publish tick.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Column layout of export rows.
///
/// Devices appear in role order; for each device every sample repeats the
/// fields of its sensors. Columns are named `<field>_<role>_<sample>`, e.g.
/// `acc_x_back_mid_3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    devices: Vec<(Role, Vec<(SensorVariant, usize, &'static str)>)>,
    samples_per_row: usize,
}

impl RowLayout {
    /// Build the layout for a device set.
    pub fn new<'a>(
        devices: impl IntoIterator<Item = (Role, &'a SensorSet)>,
        samples_per_row: usize,
    ) -> Self {
        let mut devices: Vec<_> = devices
            .into_iter()
            .map(|(role, sensors)| {
                let fields = sensors
                    .iter()
                    .flat_map(|variant| {
                        variant
                            .field_names()
                            .iter()
                            .enumerate()
                            .map(move |(i, name)| (variant, i, *name))
                    })
                    .collect();
                (role, fields)
            })
            .collect();
        devices.sort_by_key(|(role, _)| *role);
        Self {
            devices,
            samples_per_row,
        }
    }

    /// Data column names, without the timestamp and label columns.
    ///
    /// ```
    /// use posture_core::pipeline::RowLayout;
    /// use posture_types::{Role, SensorSet, SensorVariant};
    ///
    /// let light = SensorSet::new([SensorVariant::Optical]).unwrap();
    /// let layout = RowLayout::new([(Role::BackLow, &light)], 2);
    /// assert_eq!(layout.columns(), vec!["lux_back_low_0", "lux_back_low_1"]);
    /// ```
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(self.width());
        for (role, fields) in &self.devices {
            for sample in 0..self.samples_per_row {
                for (_, _, name) in fields {
                    columns.push(format!("{}_{}_{}", name, role.field_suffix(), sample));
                }
            }
        }
        columns
    }

    /// Number of data columns.
    pub fn width(&self) -> usize {
        self.devices
            .iter()
            .map(|(_, fields)| fields.len() * self.samples_per_row)
            .sum()
    }

    /// Samples collected per row.
    pub fn samples_per_row(&self) -> usize {
        self.samples_per_row
    }

    /// Values of one sample for the device at `index` (in role order).
    fn sample(&self, index: usize, snapshot: &DeviceSnapshot) -> Vec<Option<f64>> {
        self.devices[index]
            .1
            .iter()
            .map(|(variant, i, _)| {
                snapshot
                    .latest
                    .get(variant)
                    .and_then(|reading| reading.measurement.values().get(*i).copied())
            })
            .collect()
    }
}

/// Read side of one session, as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct DeviceFeed {
    /// The device.
    pub identity: DeviceIdentity,
    /// Its configured sensors.
    pub sensors: SensorSet,
    /// Latest-reading snapshots published by the session.
    pub snapshots: watch::Receiver<DeviceSnapshot>,
}

/// Export mode settings.
#[derive(Clone)]
pub struct ExportSettings {
    /// Total run time. Measured once, across restarts.
    pub duration: Duration,
    /// Label attached to every row.
    pub label: Option<String>,
    /// Samples accumulated per row.
    pub samples_per_row: usize,
    /// Pacing between samples.
    pub sample_interval: Duration,
    /// Destination of the rows.
    pub sink: SharedRowSink,
}

impl std::fmt::Debug for ExportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportSettings")
            .field("duration", &self.duration)
            .field("label", &self.label)
            .field("samples_per_row", &self.samples_per_row)
            .field("sample_interval", &self.sample_interval)
            .finish_non_exhaustive()
    }
}

/// Live mode settings.
#[derive(Clone)]
pub struct LiveSettings {
    /// How often snapshots are checked for new readings.
    pub publish_interval: Duration,
    /// Per-device JSON output.
    pub json: JsonFileSink,
    /// Destination of merged records.
    pub publisher: Arc<dyn RecordPublisher>,
}

impl std::fmt::Debug for LiveSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSettings")
            .field("publish_interval", &self.publish_interval)
            .field("json", &self.json)
            .finish_non_exhaustive()
    }
}

/// What the pipeline produces.
#[derive(Debug, Clone)]
pub enum PipelineMode {
    /// Fixed-duration collection into rows.
    Export(ExportSettings),
    /// Continuous per-device JSON plus merged publishing.
    Live(LiveSettings),
}

impl PipelineMode {
    /// Whether this is export mode.
    pub fn is_export(&self) -> bool {
        matches!(self, PipelineMode::Export(_))
    }
}

/// One cohort's aggregation task.
pub struct AggregationPipeline {
    feeds: Vec<DeviceFeed>,
    barrier: ReadinessBarrier,
    events: EventDispatcher,
    mode: PipelineMode,
    emitted: Arc<AtomicU64>,
}

impl AggregationPipeline {
    /// Create a pipeline over `feeds`. Feeds are processed in role order.
    pub fn new(
        mut feeds: Vec<DeviceFeed>,
        barrier: ReadinessBarrier,
        events: EventDispatcher,
        mode: PipelineMode,
    ) -> Self {
        feeds.sort_by(|a, b| a.identity.cmp(&b.identity));
        Self {
            feeds,
            barrier,
            events,
            mode,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share the row/record counter with earlier cohorts.
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.emitted = counter;
        self
    }

    /// Row layout for this pipeline's devices.
    pub fn layout(&self, samples_per_row: usize) -> RowLayout {
        RowLayout::new(
            self.feeds.iter().map(|f| (f.identity.role, &f.sensors)),
            samples_per_row,
        )
    }

    /// Run until cancelled or, in export mode, until `deadline`.
    ///
    /// Both cases return `Ok(())`; a row in progress at that moment is
    /// discarded. Sink failures are returned as errors.
    pub async fn run(&self, cancel: &CancellationToken, deadline: Option<Instant>) -> Result<()> {
        match &self.mode {
            PipelineMode::Export(settings) => self.run_export(settings, cancel, deadline).await,
            PipelineMode::Live(settings) => self.run_live(settings, cancel).await,
        }
    }

    async fn run_export(
        &self,
        settings: &ExportSettings,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let layout = self.layout(settings.samples_per_row);
        info!(columns = layout.width(), samples = settings.samples_per_row, "export pipeline started");

        loop {
            match bounded(cancel, deadline, self.barrier.wait_all()).await {
                Some(result) => result?,
                None => return Ok(()),
            }

            let mut per_device: Vec<Vec<Option<f64>>> = vec![Vec::new(); self.feeds.len()];
            let mut tick = interval(settings.sample_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            for _ in 0..settings.samples_per_row {
                let ticked = bounded(cancel, deadline, async {
                    tick.tick().await;
                    Ok::<(), crate::Error>(())
                })
                .await;
                if ticked.is_none() {
                    debug!("discarding partial row");
                    return Ok(());
                }
                for (index, feed) in self.feeds.iter().enumerate() {
                    let snapshot = feed.snapshots.borrow();
                    per_device[index].extend(layout.sample(index, &snapshot));
                }
            }

            let row = AggregatedRow {
                timestamp: OffsetDateTime::now_utc(),
                values: per_device.into_iter().flatten().collect(),
                label: settings.label.clone(),
            };
            let appended = bounded(cancel, None, async {
                settings.sink.lock().await.append(&row)?;
                Ok::<(), crate::Error>(())
            })
            .await;
            match appended {
                Some(result) => result?,
                None => return Ok(()),
            }

            self.barrier.clear_all();
            let rows = self.emitted.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(rows, "row appended");
            self.events.send(CohortEvent::RowEmitted { rows });
        }
    }

    async fn run_live(&self, settings: &LiveSettings, cancel: &CancellationToken) -> Result<()> {
        match bounded(cancel, None, self.barrier.wait_all()).await {
            Some(result) => result?,
            None => return Ok(()),
        }
        info!(devices = self.feeds.len(), "all devices live, publishing");

        let mut state = LiveState {
            written: ReadinessBarrier::new(self.feeds.iter().map(|f| f.identity.clone())),
            last_seen: vec![0; self.feeds.len()],
            records: vec![Map::new(); self.feeds.len()],
        };
        let mut tick = interval(settings.publish_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {}
            }
            match bounded(cancel, None, self.live_cycle(settings, &mut state)).await {
                Some(result) => result?,
                None => return Ok(()),
            }
        }
    }

    /// Write JSON for every device with a new reading; publish once all have.
    async fn live_cycle(&self, settings: &LiveSettings, state: &mut LiveState) -> Result<()> {
        for (index, feed) in self.feeds.iter().enumerate() {
            let snapshot = feed.snapshots.borrow().clone();
            if snapshot.is_empty() || snapshot.sequence == state.last_seen[index] {
                continue;
            }
            state.last_seen[index] = snapshot.sequence;

            let record = device_record(feed.identity.role, &snapshot)?;
            settings.json.write(feed.identity.role, &record).await?;
            state.records[index] = record;
            state.written.set(&feed.identity);
        }

        if !state.written.all_set() {
            return Ok(());
        }

        let mut merged = Map::new();
        for record in &state.records {
            merged.extend(record.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged.insert(TIMESTAMP_KEY.to_string(), Value::String(timestamp(OffsetDateTime::now_utc())?));

        settings.publisher.publish(&merged).await?;
        state.written.clear_all();
        let records = self.emitted.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(records, keys = merged.len(), "record published");
        self.events.send(CohortEvent::Published { records });
        Ok(())
    }
}

struct LiveState {
    /// Set per device once its JSON has been written since the last publish.
    written: ReadinessBarrier,
    last_seen: Vec<u64>,
    records: Vec<Map<String, Value>>,
}

/// JSON object for one device: `<field>_<role>` keys plus `Timestamp`.
pub fn device_record(role: Role, snapshot: &DeviceSnapshot) -> std::result::Result<Map<String, Value>, SinkError> {
    let mut record = Map::new();
    let mut newest: Option<OffsetDateTime> = None;
    for reading in snapshot.latest.values() {
        for (name, value) in reading.fields() {
            record.insert(format!("{}_{}", name, role.field_suffix()), Value::from(value));
        }
        newest = newest.max(Some(reading.timestamp));
    }
    if let Some(ts) = newest {
        record.insert(TIMESTAMP_KEY.to_string(), Value::String(timestamp(ts)?));
    }
    Ok(record)
}

fn timestamp(ts: OffsetDateTime) -> std::result::Result<String, SinkError> {
    Ok(ts.format(&Rfc3339)?)
}
