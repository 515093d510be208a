//! Stored table (Arrow batches plus metadata)
//!
//! **Write pattern**: whole-table replace or batch append, never row
//! updates. Result tables are recomputed in full for every newly closed
//! window, so there is nothing to update in place.

use crate::warehouse::Labels;
use crate::{Error, Result};
use arrow::compute;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};

/// One table held by an in-memory warehouse.
#[derive(Debug, Clone)]
pub struct StoredTable {
    batches: Vec<RecordBatch>,
    labels: Labels,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl StoredTable {
    /// Create a table from a first batch.
    #[must_use]
    pub fn new(batch: RecordBatch) -> Self {
        let now = Utc::now();
        Self {
            batches: vec![batch],
            labels: Labels::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Total rows across batches.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Whether the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Replace contents, keeping labels and creation time.
    pub fn replace(&mut self, batch: RecordBatch) {
        self.batches = vec![batch];
        self.modified_at = Utc::now();
    }

    /// Append a batch.
    ///
    /// # Errors
    ///
    /// Returns error if the batch schema doesn't match the table's.
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<()> {
        if let Some(existing) = self.batches.first() {
            // An empty placeholder adopts the first real schema
            if existing.num_columns() == 0 && self.num_rows() == 0 {
                self.replace(batch);
                return Ok(());
            }
            if batch.schema() != existing.schema() {
                return Err(Error::Warehouse(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    existing.schema(),
                    batch.schema()
                )));
            }
        }

        self.batches.push(batch);
        self.modified_at = Utc::now();
        Ok(())
    }

    /// All rows as a single batch.
    ///
    /// # Errors
    ///
    /// Returns error if the batches cannot be concatenated.
    pub fn to_batch(&self) -> Result<RecordBatch> {
        match self.batches.as_slice() {
            [single] => Ok(single.clone()),
            [first, ..] => compute::concat_batches(&first.schema(), &self.batches)
                .map_err(|e| Error::Warehouse(format!("Failed to combine batches: {e}"))),
            [] => Err(Error::Warehouse("Table has no batches".to_string())),
        }
    }

    /// Table labels.
    #[must_use]
    pub const fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Replace table labels.
    pub fn set_labels(&mut self, labels: Labels) {
        self.labels = labels;
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last modification time.
    #[must_use]
    pub const fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Bump the modification time.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}
