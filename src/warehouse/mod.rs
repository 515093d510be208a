//! Warehouse client interface
//!
//! The analytical warehouse is the only persistent shared resource. All
//! calls are synchronous and block until the warehouse has finished.
//!
//! # Write modes
//!
//! | Mode       | Used for            | Behaviour if the table has rows |
//! |------------|---------------------|---------------------------------|
//! | `Empty`    | enrollment tables   | fails with `Error::Conflict`    |
//! | `Truncate` | result & statistics | replaced                        |
//! | `Append`   | log entries         | rows appended                   |
//!
//! # Example
//!
//! ```rust
//! use trueno_analysis::warehouse::{MemoryWarehouse, Warehouse, WriteMode};
//!
//! # fn example() -> trueno_analysis::Result<()> {
//! let warehouse = MemoryWarehouse::new("project", "dataset");
//! warehouse.execute("SELECT 1", Some("enrollments_spam"), WriteMode::Empty)?;
//! assert!(warehouse.table_names()?.contains(&"enrollments_spam".to_string()));
//! # Ok(())
//! # }
//! ```

mod memory;
mod table;

pub use memory::{ExecutedStatement, MemoryWarehouse, QueryHandler};
pub use table::StoredTable;

use crate::Result;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a write treats an existing destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Write only if the table is absent or empty
    Empty,
    /// Replace existing contents
    Truncate,
    /// Append to existing contents
    Append,
}

/// Table labels (key/value metadata).
pub type Labels = BTreeMap<String, String>;

/// Analytical warehouse client.
pub trait Warehouse: Send + Sync {
    /// Project holding the dataset.
    fn project(&self) -> &str;

    /// Dataset all tables are written to.
    fn dataset(&self) -> &str;

    /// Run a statement, optionally writing its result to `destination`.
    ///
    /// # Errors
    ///
    /// `Error::Conflict` if `write_mode` is `Empty` and the destination
    /// already holds data; `Error::Warehouse` for any other failure.
    fn execute(&self, sql: &str, destination: Option<&str>, write_mode: WriteMode) -> Result<()>;

    /// Load rows into `destination`; the batch schema is the table schema.
    ///
    /// # Errors
    ///
    /// Returns error if the load job fails.
    fn load_rows(&self, rows: &RecordBatch, destination: &str, write_mode: WriteMode)
        -> Result<()>;

    /// Read a whole table as a record batch.
    ///
    /// # Errors
    ///
    /// `Error::TableNotFound` if the table does not exist.
    fn read_table(&self, table: &str) -> Result<RecordBatch>;

    /// Delete a table. No-op if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns error if deletion fails.
    fn delete_table(&self, table: &str) -> Result<()>;

    /// Refresh metadata/expiry of every table whose name contains `slug`.
    ///
    /// # Errors
    ///
    /// Returns error if any table update fails.
    fn touch_tables(&self, slug: &str) -> Result<()>;

    /// Names of all tables in the dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the dataset cannot be listed.
    fn table_names(&self) -> Result<Vec<String>>;

    /// Labels of a table; `None` if the table doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns error if metadata cannot be read.
    fn table_labels(&self, table: &str) -> Result<Option<Labels>>;

    /// Replace the labels of a table.
    ///
    /// # Errors
    ///
    /// `Error::TableNotFound` if the table does not exist.
    fn set_table_labels(&self, table: &str, labels: Labels) -> Result<()>;

    /// Earliest modification time among tables whose name contains `slug`.
    ///
    /// # Errors
    ///
    /// Returns error if metadata cannot be read.
    fn experiment_tables_first_updated(&self, slug: &str) -> Result<Option<DateTime<Utc>>>;

    /// Fully qualified `project.dataset.table` name.
    fn qualified(&self, table: &str) -> String {
        format!("{}.{}.{table}", self.project(), self.dataset())
    }
}
