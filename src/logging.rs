//! Logging setup
//!
//! Console output goes through `tracing-subscriber`'s fmt layer. Warnings
//! and errors can additionally be collected by a [`WarehouseLogLayer`] and
//! written to a warehouse table, so failures of scheduled batches can be
//! queried per experiment.

use arrow::array::{ArrayRef, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::field::{Field as EventField, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::warehouse::{Warehouse, WriteMode};
use crate::{Error, Result};

/// Default number of buffered entries before the log table is written.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`.
///
/// # Errors
///
/// Returns `Config` for an invalid directive or if a global subscriber is
/// already installed.
pub fn init(default_directive: &str, warehouse_layer: Option<WarehouseLogLayer>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| Error::Config(format!("Invalid log directive: {e}")))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(warehouse_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install logger: {e}")))
}

/// One row of the warehouse log table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// `experiment` field of the event
    pub experiment: Option<String>,
    /// Message and remaining fields
    pub message: String,
    /// `WARN` or `ERROR`
    pub log_level: String,
    /// Event target
    pub target: String,
    /// Source file
    pub file: Option<String>,
    /// Module path
    pub module: Option<String>,
}

impl LogEntry {
    /// Arrow schema of the log table.
    #[must_use]
    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new(
                "timestamp",
                DataType::Timestamp(TimeUnit::Microsecond, Some("+00:00".into())),
                false,
            ),
            Field::new("experiment", DataType::Utf8, true),
            Field::new("message", DataType::Utf8, false),
            Field::new("log_level", DataType::Utf8, false),
            Field::new("target", DataType::Utf8, false),
            Field::new("file", DataType::Utf8, true),
            Field::new("module", DataType::Utf8, true),
        ]))
    }

    /// Convert entries to a record batch.
    ///
    /// # Errors
    ///
    /// Returns error if the batch cannot be assembled.
    pub fn to_record_batch(entries: &[Self]) -> Result<RecordBatch> {
        let strings = |f: fn(&Self) -> Option<&str>| -> ArrayRef {
            Arc::new(entries.iter().map(f).collect::<StringArray>())
        };
        let columns: Vec<ArrayRef> = vec![
            Arc::new(
                TimestampMicrosecondArray::from(
                    entries
                        .iter()
                        .map(|e| e.timestamp.timestamp_micros())
                        .collect::<Vec<_>>(),
                )
                .with_timezone("+00:00"),
            ),
            strings(|e| e.experiment.as_deref()),
            strings(|e| Some(e.message.as_str())),
            strings(|e| Some(e.log_level.as_str())),
            strings(|e| Some(e.target.as_str())),
            strings(|e| e.file.as_deref()),
            strings(|e| e.module.as_deref()),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }
}

/// Collects the message and `experiment` field of an event.
#[derive(Default)]
struct EntryVisitor {
    message: String,
    experiment: Option<String>,
    fields: Vec<String>,
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &EventField, value: &str) {
        match field.name() {
            "experiment" => self.experiment = Some(value.to_string()),
            "message" => self.message = value.to_string(),
            name => self.fields.push(format!("{name}={value}")),
        }
    }

    fn record_debug(&mut self, field: &EventField, value: &dyn std::fmt::Debug) {
        match field.name() {
            "experiment" => self.experiment = Some(format!("{value:?}")),
            "message" => self.message = format!("{value:?}"),
            name => self.fields.push(format!("{name}={value:?}")),
        }
    }
}

impl EntryVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

/// Buffers WARN and ERROR events and appends them to a warehouse table.
///
/// Cloning yields a handle to the same buffer, so the caller can keep one
/// to [`flush`](Self::flush) before exiting.
#[derive(Clone)]
pub struct WarehouseLogLayer {
    warehouse: Arc<dyn Warehouse>,
    table: String,
    capacity: usize,
    buffer: Arc<Mutex<Vec<LogEntry>>>,
}

impl WarehouseLogLayer {
    /// Write to `table`, flushing every [`DEFAULT_LOG_CAPACITY`] entries.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, table: impl Into<String>) -> Self {
        Self {
            warehouse,
            table: table.into(),
            capacity: DEFAULT_LOG_CAPACITY,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Flush once `capacity` entries are buffered (minimum 1).
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|buffer| buffer.len()).unwrap_or_default()
    }

    /// Append all buffered entries to the log table.
    ///
    /// # Errors
    ///
    /// Returns error if the rows cannot be written; the entries are dropped.
    pub fn flush(&self) -> Result<()> {
        let entries = {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| Error::Other("Log buffer poisoned".to_string()))?;
            std::mem::take(&mut *buffer)
        };
        if entries.is_empty() {
            return Ok(());
        }
        self.warehouse.load_rows(
            &LogEntry::to_record_batch(&entries)?,
            &self.table,
            WriteMode::Append,
        )
    }

    fn push(&self, entry: LogEntry) -> bool {
        self.buffer.lock().is_ok_and(|mut buffer| {
            buffer.push(entry);
            buffer.len() >= self.capacity
        })
    }
}

impl<S: Subscriber> Layer<S> for WarehouseLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);
        let experiment = visitor.experiment.take();
        let entry = LogEntry {
            timestamp: Utc::now(),
            experiment,
            message: visitor.into_message(),
            log_level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            file: metadata.file().map(str::to_string),
            module: metadata.module_path().map(str::to_string),
        };

        // Buffer lock is released before the write; events it raises are buffered
        if self.push(entry) {
            if let Err(e) = self.flush() {
                eprintln!("Failed to write log entries to {}: {e}", self.table);
            }
        }
    }
}
