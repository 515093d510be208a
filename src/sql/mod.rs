//! SQL generation and validation
//!
//! The analysis never writes SQL itself: enrollment and metric queries
//! come from a [`QueryBuilder`], and the dry-run path sends them through a
//! [`DryRunner`] instead of the warehouse.
//!
//! ## Metric query shape
//!
//! ```text
//! WITH analysis_windows AS (...)      one row per window
//! , raw_enrollments AS (...)          enrollments × windows
//! , enrollments AS (...)              restricted to the enrollment period
//! , ds_0 AS (...)                     one aggregate per data source
//! SELECT enrollments.*, ds_0.metric_a, ...
//! ```
//!
//! Every metric query starts with `WITH analysis_windows AS (`; the dry-run
//! path relies on this to splice in a stand-in enrollments table.

mod dryrun;
mod templates;

pub use dryrun::{with_stand_in_enrollments, DryRunner, SqlParserDryRunner, STAND_IN_ENROLLMENTS_TABLE};
pub use templates::TemplateQueryBuilder;

use crate::config::{EnrollmentsQueryType, Metric, Segment};
use crate::timelimits::TimeLimits;
use crate::Result;

/// Opening of every metric query.
pub const METRICS_QUERY_PREFIX: &str = "WITH analysis_windows AS (";

/// Inputs of an enrollment query.
#[derive(Debug, Clone, Copy)]
pub struct EnrollmentsRequest<'a> {
    /// Experiment slug as it appears in enrollment events
    pub experiment_slug: &'a str,
    /// Warehouse dataset of the application
    pub app_dataset: &'a str,
    /// Enrollment period and windows
    pub time_limits: &'a TimeLimits,
    /// How enrollments are discovered
    pub query_type: EnrollmentsQueryType,
    /// Replacement for the platform's enrollment discovery
    pub custom_query: Option<&'a str>,
    /// Segment columns to add
    pub segments: &'a [Segment],
}

/// Produces enrollment and metric SQL.
pub trait QueryBuilder: Send + Sync {
    /// SQL selecting one row per enrolled client.
    ///
    /// Columns: `client_id`, `branch`, `enrollment_date`,
    /// `num_enrollment_events`, plus one boolean column per segment.
    ///
    /// # Errors
    ///
    /// Returns error if the query cannot be built.
    fn build_enrollments_query(&self, request: &EnrollmentsRequest<'_>) -> Result<String>;

    /// SQL aggregating `metrics` per enrolled client and window.
    ///
    /// # Errors
    ///
    /// Returns error if the query cannot be built.
    fn build_metrics_query(
        &self,
        metrics: &[&Metric],
        time_limits: &TimeLimits,
        enrollments_table: &str,
    ) -> Result<String>;
}
