//! Dry-run validation of generated SQL
//!
//! Dry runs never touch tables. The default runner parses statements with
//! `sqlparser` in the BigQuery dialect; a warehouse-backed runner can be
//! substituted to also check permissions and cost.

use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use tracing::{debug, error};

use super::METRICS_QUERY_PREFIX;
use crate::{Error, Result};

/// Name of the stand-in enrollments table in dry-run metric queries.
pub const STAND_IN_ENROLLMENTS_TABLE: &str = "enrollments_table";

/// Validates SQL without running it.
pub trait DryRunner: Send + Sync {
    /// Check `sql`.
    ///
    /// # Errors
    ///
    /// `DryRunFailed` carrying the SQL if it is rejected.
    fn dry_run(&self, sql: &str) -> Result<()>;
}

/// Syntax-only dry runs using `sqlparser`.
#[derive(Debug, Default)]
pub struct SqlParserDryRunner {
    dialect: BigQueryDialect,
}

impl SqlParserDryRunner {
    /// Create a dry runner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dialect: BigQueryDialect {},
        }
    }
}

impl DryRunner for SqlParserDryRunner {
    fn dry_run(&self, sql: &str) -> Result<()> {
        let failed = |message: String| Error::DryRunFailed {
            sql: sql.to_string(),
            message,
        };

        let statements = Parser::parse_sql(&self.dialect, sql).map_err(|e| {
            let err = failed(format!("SQL parse error: {e}"));
            if let Some(annotated) = err.annotated_sql() {
                error!("Dry run failed:\n{annotated}");
            }
            err
        })?;

        if statements.is_empty() {
            return Err(failed("No statement to validate".to_string()));
        }
        debug!(statements = statements.len(), "Dry run passed");
        Ok(())
    }
}

/// Splice a two-row stand-in enrollments table into a metric query.
///
/// The stand-in needs at least two rows; a single-row table is rejected
/// by warehouses that require a filter over partitioned columns.
///
/// ```
/// use trueno_analysis::sql::with_stand_in_enrollments;
///
/// let sql = with_stand_in_enrollments("WITH analysis_windows AS (SELECT 1) SELECT 1");
/// assert!(sql.starts_with("WITH enrollments_table AS ("));
/// ```
#[must_use]
pub fn with_stand_in_enrollments(metrics_sql: &str) -> String {
    metrics_sql.replacen(
        METRICS_QUERY_PREFIX,
        &format!(
            "WITH {STAND_IN_ENROLLMENTS_TABLE} AS (
    SELECT '00000' AS client_id,
        'test' AS branch,
        DATE('2020-01-01') AS enrollment_date
    UNION ALL
    SELECT '00000' AS client_id,
        'test' AS branch,
        DATE('2020-01-01') AS enrollment_date
), analysis_windows AS ("
        ),
        1,
    )
}
