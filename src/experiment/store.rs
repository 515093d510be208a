//! Experiment collection - the set of experiments known to the registry
//!
//! The batch driver filters this collection to decide which experiments
//! to analyse.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::Experiment;
use crate::Result;

/// Experiment types the batch driver analyses when running "all".
pub const RECOGNIZED_EXPERIMENT_TYPES: [&str; 4] = ["pref", "addon", "message", "v6"];

/// Source of experiment metadata (the experiment registry).
pub trait ExperimentSource: Send + Sync {
    /// Fetch the current collection.
    ///
    /// # Errors
    ///
    /// Returns error if the registry cannot be read.
    fn experiments(&self) -> Result<ExperimentCollection>;
}

/// In-memory collection of experiments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentCollection {
    experiments: Vec<Experiment>,
}

impl ExperimentCollection {
    /// Create a collection.
    #[must_use]
    pub const fn new(experiments: Vec<Experiment>) -> Self {
        Self { experiments }
    }

    /// Parse a JSON array of experiments.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    /// Load a JSON array of experiments from a file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// All experiments.
    #[must_use]
    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    /// Check if the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Experiments matching a normandy or experimenter slug.
    #[must_use]
    pub fn with_slug(&self, slug: &str) -> Self {
        self.filter(|e| e.normandy_slug() == Some(slug) || e.experimenter_slug() == slug)
    }

    /// Experiments still running on `date` (no end date, or ending on/after it).
    #[must_use]
    pub fn end_on_or_after(&self, date: NaiveDate) -> Self {
        self.filter(|e| e.start_date().is_some() && e.end_date().map_or(true, |end| end >= date))
    }

    /// Experiments of one of the given types.
    #[must_use]
    pub fn of_type(&self, types: &[&str]) -> Self {
        self.filter(|e| types.contains(&e.experiment_type()))
    }

    fn filter(&self, predicate: impl Fn(&Experiment) -> bool) -> Self {
        Self::new(
            self.experiments
                .iter()
                .filter(|e| predicate(e))
                .cloned()
                .collect(),
        )
    }
}

impl ExperimentSource for ExperimentCollection {
    fn experiments(&self) -> Result<ExperimentCollection> {
        Ok(self.clone())
    }
}
