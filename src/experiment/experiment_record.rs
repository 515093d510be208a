//! Experiment Record - experiment metadata as published by the experiment registry

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    /// Not yet launched
    Draft,
    /// Under review before launch
    Review,
    /// Accepted, waiting to launch
    Accepted,
    /// Enrolling or observing
    Live,
    /// Finished; the overall analysis fires on its end date
    Complete,
}

/// One branch of an experiment and its allocation ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch slug, as it appears in the `branch` column
    pub slug: String,
    /// Relative allocation
    pub ratio: f64,
}

impl Branch {
    /// Create a branch.
    #[must_use]
    pub fn new(slug: impl Into<String>, ratio: f64) -> Self {
        Self {
            slug: slug.into(),
            ratio,
        }
    }
}

/// Experiment metadata.
///
/// This is the input to configuration resolution; the analysis itself
/// reads the resolved `ExperimentConfiguration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    experimenter_slug: String,
    #[serde(default)]
    normandy_slug: Option<String>,
    #[serde(rename = "type")]
    experiment_type: String,
    #[serde(default)]
    status: Option<ExperimentStatus>,
    #[serde(default)]
    start_date: Option<NaiveDate>,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    proposed_enrollment: Option<u32>,
    #[serde(default)]
    branches: Vec<Branch>,
    #[serde(default)]
    reference_branch: Option<String>,
    #[serde(default)]
    is_high_population: bool,
    #[serde(default = "default_app_name")]
    app_name: String,
    #[serde(default = "default_app_id")]
    app_id: String,
}

fn default_app_name() -> String {
    "firefox_desktop".to_string()
}

fn default_app_id() -> String {
    "firefox-desktop".to_string()
}

impl Experiment {
    /// Create a builder for an experiment record.
    #[must_use]
    pub fn builder(experimenter_slug: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder::new(experimenter_slug)
    }

    /// Slug in the experiment registry.
    #[must_use]
    pub fn experimenter_slug(&self) -> &str {
        &self.experimenter_slug
    }

    /// Slug used for enrollment and table names.
    #[must_use]
    pub fn normandy_slug(&self) -> Option<&str> {
        self.normandy_slug.as_deref()
    }

    /// Experiment type (pref, addon, message, v6, ...).
    #[must_use]
    pub fn experiment_type(&self) -> &str {
        &self.experiment_type
    }

    /// Lifecycle status.
    #[must_use]
    pub const fn status(&self) -> Option<ExperimentStatus> {
        self.status
    }

    /// Launch date, if launched.
    #[must_use]
    pub const fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    /// End date, if known.
    #[must_use]
    pub const fn end_date(&self) -> Option<NaiveDate> {
        self.end_date
    }

    /// Proposed enrollment length in days.
    #[must_use]
    pub const fn proposed_enrollment(&self) -> Option<u32> {
        self.proposed_enrollment
    }

    /// Configured branches.
    #[must_use]
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Branch that comparisons are made against.
    #[must_use]
    pub fn reference_branch(&self) -> Option<&str> {
        self.reference_branch.as_deref()
    }

    /// Whether the enrolled population is too large to analyse.
    #[must_use]
    pub const fn is_high_population(&self) -> bool {
        self.is_high_population
    }

    /// Application name (selects platform defaults).
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Application identifier (selects the source dataset).
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

/// Builder for `Experiment`.
#[derive(Debug)]
pub struct ExperimentBuilder {
    experiment: Experiment,
}

impl ExperimentBuilder {
    /// Create a new builder with the required slug.
    #[must_use]
    pub fn new(experimenter_slug: impl Into<String>) -> Self {
        let experimenter_slug = experimenter_slug.into();
        Self {
            experiment: Experiment {
                normandy_slug: Some(experimenter_slug.clone()),
                experimenter_slug,
                experiment_type: "v6".to_string(),
                status: None,
                start_date: None,
                end_date: None,
                proposed_enrollment: None,
                branches: Vec::new(),
                reference_branch: None,
                is_high_population: false,
                app_name: default_app_name(),
                app_id: default_app_id(),
            },
        }
    }

    /// Set (or clear) the normandy slug.
    #[must_use]
    pub fn normandy_slug(mut self, slug: Option<&str>) -> Self {
        self.experiment.normandy_slug = slug.map(str::to_string);
        self
    }

    /// Set the experiment type.
    #[must_use]
    pub fn experiment_type(mut self, experiment_type: impl Into<String>) -> Self {
        self.experiment.experiment_type = experiment_type.into();
        self
    }

    /// Set the status.
    #[must_use]
    pub const fn status(mut self, status: ExperimentStatus) -> Self {
        self.experiment.status = Some(status);
        self
    }

    /// Set the start date.
    #[must_use]
    pub const fn start_date(mut self, date: NaiveDate) -> Self {
        self.experiment.start_date = Some(date);
        self
    }

    /// Set the end date.
    #[must_use]
    pub const fn end_date(mut self, date: NaiveDate) -> Self {
        self.experiment.end_date = Some(date);
        self
    }

    /// Set the proposed enrollment length.
    #[must_use]
    pub const fn proposed_enrollment(mut self, days: u32) -> Self {
        self.experiment.proposed_enrollment = Some(days);
        self
    }

    /// Add a branch.
    #[must_use]
    pub fn branch(mut self, slug: impl Into<String>, ratio: f64) -> Self {
        self.experiment.branches.push(Branch::new(slug, ratio));
        self
    }

    /// Set the reference branch.
    #[must_use]
    pub fn reference_branch(mut self, slug: impl Into<String>) -> Self {
        self.experiment.reference_branch = Some(slug.into());
        self
    }

    /// Flag the experiment as high population.
    #[must_use]
    pub const fn high_population(mut self, flag: bool) -> Self {
        self.experiment.is_high_population = flag;
        self
    }

    /// Set the application name and id.
    #[must_use]
    pub fn app(mut self, app_name: impl Into<String>, app_id: impl Into<String>) -> Self {
        self.experiment.app_name = app_name.into();
        self.experiment.app_id = app_id.into();
        self
    }

    /// Build the `Experiment`.
    #[must_use]
    pub fn build(self) -> Experiment {
        self.experiment
    }
}
