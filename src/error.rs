//! Error types for Trueno-Analysis
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Errors fall into three families:
//! - **Expected** preconditions (`NoSlug` .. `Ended`): the experiment is not
//!   analysable today. Logged and excluded, never a batch failure.
//! - **Fatal validation** (`EnrollmentLongerThanAnalysis`): the experiment
//!   configuration is inconsistent. Always propagated.
//! - Everything else: unanticipated failures of a single experiment.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-Analysis error types
#[derive(Error, Debug)]
pub enum Error {
    /// Experiment has no normandy slug, so nothing can be named after it
    #[error("Experiment {experiment} has no normandy slug")]
    NoSlug {
        /// Experimenter slug of the offending experiment
        experiment: String,
    },

    /// Analysis spec carries `skip = true`
    #[error("Found an explicit skip directive for {slug}")]
    ExplicitSkip {
        /// Experiment slug
        slug: String,
    },

    /// Population too large to analyse safely
    #[error("Experiment {slug} is flagged as high population; skipping analysis")]
    HighPopulation {
        /// Experiment slug
        slug: String,
    },

    /// No proposed enrollment period configured
    #[error("Experiment {slug} has no enrollment period")]
    NoEnrollmentPeriod {
        /// Experiment slug
        slug: String,
    },

    /// Experiment has not launched (no start date)
    #[error("Experiment {slug} has no start date")]
    NoStartDate {
        /// Experiment slug
        slug: String,
    },

    /// Experiment ended before the analysis date
    #[error("Experiment {slug} has already ended")]
    Ended {
        /// Experiment slug
        slug: String,
    },

    /// Enrollment period longer than the observed experiment lifetime
    #[error("Enrollment period of {slug} is longer than its analysis period\nCheck the proposed enrollment and the start/end dates")]
    EnrollmentLongerThanAnalysis {
        /// Experiment slug
        slug: String,
    },

    /// Not enough days of data to form an analysis window yet
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Segment column missing from the metrics table
    #[error("Segment {segment} not in metrics table")]
    UnknownSegment {
        /// Segment name
        segment: String,
    },

    /// Statistic name not present in the registry
    #[error("Statistic {0} does not exist")]
    UnknownStatistic(String),

    /// Warehouse refused a create-if-absent write
    #[error("Table {table} already exists")]
    Conflict {
        /// Destination table
        table: String,
    },

    /// Table does not exist in the warehouse
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Any other warehouse failure
    #[error("Warehouse error: {0}")]
    Warehouse(String),

    /// SQL rejected by a dry run
    #[error("Dry run failed: {message}")]
    DryRunFailed {
        /// The rejected SQL text
        sql: String,
        /// Validator message
        message: String,
    },

    /// Analysis spec could not be resolved
    #[error("Configuration error: {0}")]
    Config(String),

    /// Custom configuration passed to a remote execution strategy
    #[error("Custom configurations are not supported when running on a remote cluster")]
    RemoteConfigOverride,

    /// Remote workflow submission or monitoring failed
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this is an expected precondition failure.
    ///
    /// The batch layer logs these without marking the batch failed.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NoSlug { .. }
                | Self::ExplicitSkip { .. }
                | Self::HighPopulation { .. }
                | Self::NoEnrollmentPeriod { .. }
                | Self::NoStartDate { .. }
                | Self::Ended { .. }
        )
    }

    /// SQL text attached to a failed dry run, with numbered lines.
    #[must_use]
    pub fn annotated_sql(&self) -> Option<String> {
        match self {
            Self::DryRunFailed { sql, .. } => Some(
                sql.lines()
                    .enumerate()
                    .map(|(i, line)| format!("{:4} {}", i + 1, line.trim_end()))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    }
}
