//! Output sinks for aggregated data.
//!
//! - [`RowSink`]: append-only row output for export mode ([`CsvSink`]).
//! - [`JsonFileSink`]: one JSON object per device, overwritten every cycle.
//! - [`RecordPublisher`]: merged live records (MQTT in the service crate).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{debug, info};

use posture_types::Role;

/// Errors raised by output sinks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    /// CSV encoding or file error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timestamp could not be formatted.
    #[error("Timestamp formatting failed: {0}")]
    Timestamp(#[from] time::error::Format),

    /// The existing file was written with a different column layout.
    #[error(
        "CSV header of {} does not match this configuration (expected {} columns, found {}{})",
        path.display(),
        expected.len(),
        found.len(),
        first_difference(expected, found).map(|c| format!(", first difference at '{c}'")).unwrap_or_default()
    )]
    SchemaMismatch {
        /// The file being appended to.
        path: PathBuf,
        /// Header derived from the configuration.
        expected: Vec<String>,
        /// Header found in the file.
        found: Vec<String>,
    },

    /// A row does not have one value per data column.
    #[error("row has {actual} values but the header declares {expected} data columns")]
    RowWidth {
        /// Data columns in the header.
        expected: usize,
        /// Values in the row.
        actual: usize,
    },

    /// Publishing a live record failed.
    #[error("Publish failed: {0}")]
    Publish(String),
}

fn first_difference(expected: &[String], found: &[String]) -> Option<String> {
    expected
        .iter()
        .zip(found.iter())
        .find(|(e, f)| e != f)
        .map(|(e, _)| e.clone())
}

/// One export row: a timestamp, one value per data column and a label.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    /// When the row was assembled.
    pub timestamp: OffsetDateTime,
    /// One entry per data column; `None` if the device had no reading for it.
    pub values: Vec<Option<f64>>,
    /// Opaque classification tag.
    pub label: Option<String>,
}

/// Append-only row output.
pub trait RowSink: Send {
    /// Append one row. Rows are appended exactly once, in order.
    fn append(&mut self, row: &AggregatedRow) -> Result<(), SinkError>;
}

/// Row sink shared between successive cohorts.
pub type SharedRowSink = Arc<Mutex<Box<dyn RowSink>>>;

/// Wrap a sink for sharing.
pub fn shared(sink: impl RowSink + 'static) -> SharedRowSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

/// Name of the leading timestamp column.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Name of the trailing label column.
pub const LABEL_COLUMN: &str = "label";

/// CSV file sink.
///
/// The full header is `timestamp`, the data columns, then `label`. A new or
/// empty file gets the header on open; an existing file must already carry
/// exactly that header.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    data_columns: usize,
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Open `path` for appending rows with the given data columns.
    ///
    /// # Errors
    ///
    /// [`SinkError::SchemaMismatch`] if the file exists with a different
    /// header, or any I/O error.
    pub fn open(path: impl Into<PathBuf>, data_columns: &[String]) -> Result<Self, SinkError> {
        let path = path.into();
        let header = full_header(data_columns);
        let has_header = Self::check_header(&path, data_columns)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if !has_header {
            writer.write_record(&header)?;
            writer.flush()?;
            info!(path = %path.display(), columns = header.len(), "created CSV file");
        } else {
            info!(path = %path.display(), "appending to existing CSV file");
        }

        Ok(Self {
            path,
            data_columns: data_columns.len(),
            writer,
        })
    }

    /// Compare an existing file's header with the expected layout.
    ///
    /// Returns `Ok(true)` if the file exists and its header matches,
    /// `Ok(false)` if the file is missing or empty.
    pub fn check_header(path: &Path, data_columns: &[String]) -> Result<bool, SinkError> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() == 0 {
            return Ok(false);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let found: Vec<String> = match reader.records().next() {
            Some(record) => record?.iter().map(str::to_string).collect(),
            None => Vec::new(),
        };

        let expected = full_header(data_columns);
        if found != expected {
            return Err(SinkError::SchemaMismatch {
                path: path.to_path_buf(),
                expected,
                found,
            });
        }
        Ok(true)
    }

    /// The file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSink for CsvSink {
    fn append(&mut self, row: &AggregatedRow) -> Result<(), SinkError> {
        if row.values.len() != self.data_columns {
            return Err(SinkError::RowWidth {
                expected: self.data_columns,
                actual: row.values.len(),
            });
        }

        let mut record = Vec::with_capacity(row.values.len() + 2);
        record.push(row.timestamp.format(&Rfc3339)?);
        record.extend(
            row.values
                .iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
        );
        record.push(row.label.clone().unwrap_or_default());

        self.writer.write_record(&record)?;
        self.writer.flush()?;
        debug!(path = %self.path.display(), "row appended");
        Ok(())
    }
}

fn full_header(data_columns: &[String]) -> Vec<String> {
    let mut header = Vec::with_capacity(data_columns.len() + 2);
    header.push(TIMESTAMP_COLUMN.to_string());
    header.extend(data_columns.iter().cloned());
    header.push(LABEL_COLUMN.to_string());
    header
}

/// Per-device JSON output, one file per role, overwritten each cycle.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    /// Write files into `dir`, creating it on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the file for `role`.
    pub fn path_for(&self, role: Role) -> PathBuf {
        self.dir.join(format!("{}.json", role.field_suffix()))
    }

    /// Replace the file for `role` with `record`.
    ///
    /// Readers never observe a half-written file: the object is written to a
    /// temporary file which is then renamed over the target.
    pub async fn write(&self, role: Role, record: &Map<String, Value>) -> Result<PathBuf, SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(role);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}

/// Destination for merged live records.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Publish one merged record.
    async fn publish(&self, record: &Map<String, Value>) -> Result<(), SinkError>;
}
