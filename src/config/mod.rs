//! Analysis configuration
//!
//! ## Layers
//!
//! ```text
//! platform defaults (TOML) ──merge──> external spec (TOML) ──merge──> AnalysisSpec
//!                                                                        │ resolve(Experiment)
//!                                                                        ▼
//!                                                            ExperimentConfiguration
//! ```
//!
//! `AnalysisSpec` is the raw, mergeable form. `ExperimentConfiguration` is
//! the resolved, read-only value that drives exactly one analysis run.

mod external;
mod platform;
mod spec;

pub use external::{ExternalConfig, ExternalConfigCollection, ExternalConfigSource};
pub use platform::{EnrollmentsQueryType, Platform};
pub use spec::{
    AnalysisSpec, DataSourceDefinition, ExperimentSpec, MetricDefinition, MetricsSpec,
    SegmentDefinition, SegmentsSpec,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cadence::Cadence;
use crate::experiment::{Branch, ExperimentStatus};

/// Where metric or segment data is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// Data source name
    pub name: String,
    /// SQL `FROM` expression
    pub from_expression: String,
    /// Column holding the client identifier
    pub client_id_column: String,
    /// Column holding the submission date
    pub submission_date_column: String,
}

/// A resolved metric: an aggregate over a data source, per client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name; also the column name in result tables
    pub name: String,
    /// Aggregate SQL expression
    pub select_expression: String,
    /// Source of the rows aggregated
    pub data_source: DataSource,
    /// Human-readable name
    pub friendly_name: Option<String>,
    /// Description
    pub description: Option<String>,
}

/// A statistic by name, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticSpec {
    /// Registry name
    pub name: String,
    /// Parameters from the config file
    pub params: serde_json::Value,
}

/// A metric paired with one statistic to run over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// The metric
    pub metric: Metric,
    /// The statistic
    pub statistic: StatisticSpec,
}

/// A named boolean subpopulation of enrolled clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment name; also the boolean column name in result tables
    pub name: String,
    /// Aggregate SQL expression yielding a boolean per client
    pub select_expression: String,
    /// Source of the rows aggregated
    pub data_source: DataSource,
}

/// Fully resolved configuration of one experiment's analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    pub(crate) experimenter_slug: String,
    pub(crate) normandy_slug: Option<String>,
    pub(crate) experiment_type: String,
    pub(crate) status: Option<ExperimentStatus>,
    pub(crate) start_date: Option<NaiveDate>,
    pub(crate) end_date: Option<NaiveDate>,
    pub(crate) proposed_enrollment: Option<u32>,
    pub(crate) branches: Vec<Branch>,
    pub(crate) reference_branch: Option<String>,
    pub(crate) is_high_population: bool,
    pub(crate) skip: bool,
    pub(crate) enrollment_query: Option<String>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) platform: Platform,
    pub(crate) app_id: String,
    pub(crate) metrics: BTreeMap<Cadence, Vec<Summary>>,
}

impl ExperimentConfiguration {
    /// Slug in the experiment registry.
    #[must_use]
    pub fn experimenter_slug(&self) -> &str {
        &self.experimenter_slug
    }

    /// Stable identifier used for enrollment and table names.
    #[must_use]
    pub fn normandy_slug(&self) -> Option<&str> {
        self.normandy_slug.as_deref()
    }

    /// Slug for log context: normandy slug, else experimenter slug.
    #[must_use]
    pub fn log_slug(&self) -> &str {
        self.normandy_slug().unwrap_or(&self.experimenter_slug)
    }

    /// Experiment type.
    #[must_use]
    pub fn experiment_type(&self) -> &str {
        &self.experiment_type
    }

    /// Lifecycle status.
    #[must_use]
    pub const fn status(&self) -> Option<ExperimentStatus> {
        self.status
    }

    /// Start date, after overrides.
    #[must_use]
    pub const fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    /// End date, after overrides.
    #[must_use]
    pub const fn end_date(&self) -> Option<NaiveDate> {
        self.end_date
    }

    /// Proposed enrollment length in days, after overrides.
    #[must_use]
    pub const fn proposed_enrollment(&self) -> Option<u32> {
        self.proposed_enrollment
    }

    /// Configured branches.
    #[must_use]
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Reference branch for comparisons.
    #[must_use]
    pub fn reference_branch(&self) -> Option<&str> {
        self.reference_branch.as_deref()
    }

    /// Whether the population is too large to analyse.
    #[must_use]
    pub const fn is_high_population(&self) -> bool {
        self.is_high_population
    }

    /// Whether the analysis spec asks to skip this experiment.
    #[must_use]
    pub const fn skip(&self) -> bool {
        self.skip
    }

    /// Custom enrollment SQL, if any.
    #[must_use]
    pub fn enrollment_query(&self) -> Option<&str> {
        self.enrollment_query.as_deref()
    }

    /// Segments analysed in addition to "all".
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Platform of the experiment.
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Application identifier.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Configured metrics per cadence.
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<Cadence, Vec<Summary>> {
        &self.metrics
    }

    /// Replace the metrics of one cadence.
    pub fn set_metrics(&mut self, cadence: Cadence, summaries: Vec<Summary>) {
        self.metrics.insert(cadence, summaries);
    }

    /// Replace the segment list.
    pub fn set_segments(&mut self, segments: Vec<Segment>) {
        self.segments = segments;
    }

    /// Distinct metrics of one cadence, in configuration order.
    #[must_use]
    pub fn metrics_for(&self, cadence: Cadence) -> Vec<&Metric> {
        let mut seen = Vec::<&Metric>::new();
        for summary in self.metrics.get(&cadence).into_iter().flatten() {
            if !seen.iter().any(|m| m.name == summary.metric.name) {
                seen.push(&summary.metric);
            }
        }
        seen
    }

    /// Distinct metrics across every cadence.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<&Metric> {
        let mut seen = Vec::<&Metric>::new();
        for cadence in self.metrics.keys() {
            for metric in self.metrics_for(*cadence) {
                if !seen.iter().any(|m| m.name == metric.name) {
                    seen.push(metric);
                }
            }
        }
        seen
    }
}
