//! In-memory warehouse implementation using `DashMap`.
//!
//! Data is lost on process restart. It cannot evaluate SQL: results of
//! `execute` come from a pluggable [`QueryHandler`], and every statement
//! is recorded so callers can inspect what would have run.

use super::{Labels, StoredTable, Warehouse, WriteMode};
use crate::naming::normalize_name;
use crate::{Error, Result};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Produces the result rows of a statement, if it has any.
pub type QueryHandler = Arc<dyn Fn(&str) -> Option<RecordBatch> + Send + Sync>;

/// A statement the warehouse was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    /// SQL text
    pub sql: String,
    /// Destination table, if any
    pub destination: Option<String>,
    /// Write mode requested
    pub write_mode: WriteMode,
}

/// In-memory warehouse using a lock-free concurrent hashmap.
///
/// Thread-safe: task graph nodes on different workers may write
/// concurrently.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use arrow::array::Int64Array;
/// use arrow::datatypes::{DataType, Field, Schema};
/// use arrow::record_batch::RecordBatch;
/// use trueno_analysis::warehouse::{MemoryWarehouse, Warehouse, WriteMode};
///
/// # fn example() -> trueno_analysis::Result<()> {
/// let warehouse = MemoryWarehouse::new("project", "dataset").with_query_handler(|_sql| {
///     let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
///     RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).ok()
/// });
/// warehouse.execute("SELECT 1 AS n", Some("ones"), WriteMode::Truncate)?;
/// assert_eq!(warehouse.read_table("ones")?.num_rows(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MemoryWarehouse {
    project: String,
    dataset: String,
    tables: DashMap<String, StoredTable>,
    statements: Mutex<Vec<ExecutedStatement>>,
    query_handler: Option<QueryHandler>,
    writes: AtomicUsize,
}

impl MemoryWarehouse {
    /// Create an empty warehouse for `project.dataset`.
    #[must_use]
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            tables: DashMap::new(),
            statements: Mutex::new(Vec::new()),
            query_handler: None,
            writes: AtomicUsize::new(0),
        }
    }

    /// Answer statements with `handler`; `None` yields an empty result.
    #[must_use]
    pub fn with_query_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> Option<RecordBatch> + Send + Sync + 'static,
    {
        self.query_handler = Some(Arc::new(handler));
        self
    }

    /// Create or replace a table directly (test fixtures).
    pub fn insert_table(&self, name: impl Into<String>, batch: RecordBatch) {
        self.tables.insert(name.into(), StoredTable::new(batch));
    }

    /// Get the number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if the warehouse holds no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Statements executed so far, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.statements
            .lock()
            .map(|statements| statements.clone())
            .unwrap_or_default()
    }

    /// Number of table writes, loads, and deletions performed.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Modification time of a table.
    #[must_use]
    pub fn modified_at(&self, table: &str) -> Option<DateTime<Utc>> {
        self.tables.get(table).map(|t| t.modified_at())
    }

    fn record(&self, sql: &str, destination: Option<&str>, write_mode: WriteMode) -> Result<()> {
        self.statements
            .lock()
            .map_err(|_| Error::Warehouse("statement log poisoned".to_string()))?
            .push(ExecutedStatement {
                sql: sql.to_string(),
                destination: destination.map(str::to_string),
                write_mode,
            });
        Ok(())
    }

    fn write(&self, batch: RecordBatch, destination: &str, write_mode: WriteMode) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        match self.tables.entry(destination.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(StoredTable::new(batch));
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => match write_mode {
                WriteMode::Empty if !slot.get().is_empty() => Err(Error::Conflict {
                    table: destination.to_string(),
                }),
                WriteMode::Empty | WriteMode::Truncate => {
                    slot.get_mut().replace(batch);
                    Ok(())
                }
                WriteMode::Append => slot.get_mut().append_batch(batch),
            },
        }
    }
}

impl Warehouse for MemoryWarehouse {
    fn project(&self) -> &str {
        &self.project
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn execute(&self, sql: &str, destination: Option<&str>, write_mode: WriteMode) -> Result<()> {
        self.record(sql, destination, write_mode)?;
        let Some(destination) = destination else {
            return Ok(());
        };
        let batch = self
            .query_handler
            .as_ref()
            .and_then(|handler| handler(sql))
            .unwrap_or_else(|| RecordBatch::new_empty(Arc::new(Schema::empty())));
        self.write(batch, destination, write_mode)
    }

    fn load_rows(
        &self,
        rows: &RecordBatch,
        destination: &str,
        write_mode: WriteMode,
    ) -> Result<()> {
        self.write(rows.clone(), destination, write_mode)
    }

    fn read_table(&self, table: &str) -> Result<RecordBatch> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?
            .to_batch()
    }

    fn delete_table(&self, table: &str) -> Result<()> {
        if self.tables.remove(table).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn touch_tables(&self, slug: &str) -> Result<()> {
        let normalized = normalize_name(slug);
        for mut table in self.tables.iter_mut() {
            if table.key().contains(&normalized) {
                table.value_mut().touch();
            }
        }
        Ok(())
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn table_labels(&self, table: &str) -> Result<Option<Labels>> {
        Ok(self.tables.get(table).map(|t| t.labels().clone()))
    }

    fn set_table_labels(&self, table: &str, labels: Labels) -> Result<()> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?
            .set_labels(labels);
        Ok(())
    }

    fn experiment_tables_first_updated(&self, slug: &str) -> Result<Option<DateTime<Utc>>> {
        let normalized = normalize_name(slug);
        Ok(self
            .tables
            .iter()
            .filter(|t| t.key().contains(&normalized))
            .map(|t| t.value().modified_at())
            .min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field};

    fn ones(n: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1; n]))]).unwrap()
    }

    fn warehouse() -> MemoryWarehouse {
        MemoryWarehouse::new("p", "d").with_query_handler(|_| Some(ones(2)))
    }

    #[test]
    fn test_write_empty_conflicts_on_data() {
        let warehouse = warehouse();
        warehouse.execute("SELECT", Some("t"), WriteMode::Empty).unwrap();
        let err = warehouse.execute("SELECT", Some("t"), WriteMode::Empty).unwrap_err();
        assert!(matches!(err, Error::Conflict { table } if table == "t"));
    }

    #[test]
    fn test_truncate_replaces() {
        let warehouse = warehouse();
        warehouse.execute("SELECT", Some("t"), WriteMode::Truncate).unwrap();
        warehouse.execute("SELECT", Some("t"), WriteMode::Truncate).unwrap();
        assert_eq!(warehouse.read_table("t").unwrap().num_rows(), 2);
        assert_eq!(warehouse.write_count(), 2);
    }

    #[test]
    fn test_append_accumulates() {
        let warehouse = warehouse();
        warehouse.load_rows(&ones(1), "logs", WriteMode::Append).unwrap();
        warehouse.load_rows(&ones(3), "logs", WriteMode::Append).unwrap();
        assert_eq!(warehouse.read_table("logs").unwrap().num_rows(), 4);
    }

    #[test]
    fn test_statements_without_destination_do_not_write() {
        let warehouse = warehouse();
        warehouse.execute("CREATE OR REPLACE VIEW v AS (SELECT 1)", None, WriteMode::Truncate).unwrap();
        assert_eq!(warehouse.write_count(), 0);
        assert_eq!(warehouse.statements().len(), 1);
        assert!(warehouse.is_empty());
    }

    #[test]
    fn test_read_missing_table() {
        assert!(matches!(warehouse().read_table("nope"), Err(Error::TableNotFound(_))));
    }

    #[test]
    fn test_labels_and_delete() {
        let warehouse = warehouse();
        assert!(warehouse.table_labels("t").unwrap().is_none());
        warehouse.insert_table("t", ones(1));
        let mut labels = Labels::new();
        labels.insert("a".to_string(), "b".to_string());
        warehouse.set_table_labels("t", labels.clone()).unwrap();
        assert_eq!(warehouse.table_labels("t").unwrap(), Some(labels));
        warehouse.delete_table("t").unwrap();
        warehouse.delete_table("t").unwrap();
        assert!(warehouse.is_empty());
    }

    #[test]
    fn test_first_updated_matches_slug() {
        let warehouse = warehouse();
        assert!(warehouse.experiment_tables_first_updated("my-exp").unwrap().is_none());
        warehouse.insert_table("my_exp_week_1", ones(1));
        warehouse.insert_table("other_week_1", ones(1));
        assert!(warehouse.experiment_tables_first_updated("my-exp").unwrap().is_some());
        warehouse.touch_tables("my-exp").unwrap();
    }
}
