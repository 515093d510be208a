//! Batch execution
//!
//! ## Flow
//!
//! ```text
//! AnalysisExecutor ──> worklist [(slug, date)] ──> ExecutorStrategy
//!                                                   ├─ SerialExecutorStrategy (in process)
//!                                                   └─ RemoteExecutorStrategy (workflow submission)
//! ```
//!
//! Toyota Way: one experiment's failure never stops the line for the
//! others. Strategies catch errors per experiment and report a single
//! success flag for the batch.

pub mod commands;
mod remote;
mod serial;

pub use remote::{
    ExperimentDates, RemoteExecutorStrategy, WorkflowClient, WorkflowRequest, WorkflowStatus,
};
pub use serial::SerialExecutorStrategy;

use chrono::{Duration, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::analysis::{Analysis, AnalysisEnvironment};
use crate::config::{AnalysisSpec, ExperimentConfiguration, ExternalConfigSource};
use crate::experiment::{Experiment, ExperimentSource, RECOGNIZED_EXPERIMENT_TYPES};
use crate::naming::enrollments_table_name;
use crate::{Error, Result};

/// One unit of batch work: analyse `slug` as of a date.
pub type WorkItem = (String, NaiveDate);

/// Per-experiment configuration overrides, by slug.
pub type ConfigurationMap = BTreeMap<String, AnalysisSpec>;

/// Where a worklist is executed.
pub trait ExecutorStrategy: Send + Sync {
    /// Execute every item; `Ok(false)` if any experiment failed.
    ///
    /// # Errors
    ///
    /// Returns error only if the batch as a whole cannot be executed.
    fn execute(
        &self,
        worklist: &[WorkItem],
        configuration_map: Option<&ConfigurationMap>,
    ) -> Result<bool>;
}

/// Dates to analyse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDate {
    /// A single date
    Single(NaiveDate),
    /// Every date from the experiment's start up to yesterday
    All,
}

/// Experiments to analyse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slugs {
    /// These slugs
    List(Vec<String>),
    /// Every recognized experiment still running on the run date
    All,
}

/// Most recent date with complete data: yesterday (UTC).
#[must_use]
pub fn today() -> NaiveDate {
    Utc::now().date_naive() - Duration::days(1)
}

/// Resolve the configuration of `experiment`.
///
/// An entry in `configuration_map` wins over the external config source.
///
/// # Errors
///
/// Returns error if the analysis spec cannot be resolved.
pub fn resolve_configuration(
    experiment: &Experiment,
    configuration_map: Option<&ConfigurationMap>,
    configs: &dyn ExternalConfigSource,
    env: &AnalysisEnvironment,
) -> Result<ExperimentConfiguration> {
    let slug = experiment
        .normandy_slug()
        .unwrap_or_else(|| experiment.experimenter_slug());
    let mut spec = AnalysisSpec::default_for_experiment(experiment)?;
    match configuration_map.and_then(|map| map.get(slug)) {
        Some(custom) => spec.merge(custom.clone()),
        None => {
            if let Some(external) = configs.configs()?.spec_for_experiment(slug) {
                spec.merge(external.clone());
            }
        }
    }
    spec.resolve_with(experiment, &env.statistics)
}

/// Builds the worklist of a batch and hands it to a strategy.
pub struct AnalysisExecutor {
    env: AnalysisEnvironment,
    experiments: Arc<dyn ExperimentSource>,
    configs: Arc<dyn ExternalConfigSource>,
    date: RunDate,
    slugs: Slugs,
    configuration_map: Option<ConfigurationMap>,
    recreate_enrollments: bool,
    today: Option<NaiveDate>,
}

impl AnalysisExecutor {
    /// Create an executor for `date` and `slugs`.
    #[must_use]
    pub fn new(
        env: AnalysisEnvironment,
        experiments: Arc<dyn ExperimentSource>,
        configs: Arc<dyn ExternalConfigSource>,
        date: RunDate,
        slugs: Slugs,
    ) -> Self {
        Self {
            env,
            experiments,
            configs,
            date,
            slugs,
            configuration_map: None,
            recreate_enrollments: false,
            today: None,
        }
    }

    /// Use custom configurations for some experiments.
    #[must_use]
    pub fn configuration_map(mut self, map: ConfigurationMap) -> Self {
        self.configuration_map = Some(map);
        self
    }

    /// Delete enrollment tables before running so they are recreated.
    #[must_use]
    pub const fn recreate_enrollments(mut self, recreate: bool) -> Self {
        self.recreate_enrollments = recreate;
        self
    }

    /// Override "today" (the last date with complete data).
    #[must_use]
    pub const fn today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn current_day(&self) -> NaiveDate {
        self.today.unwrap_or_else(today)
    }

    /// Experiments selected by the slug and date filters.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for all experiments over all dates, or an
    /// error from the experiment source.
    pub fn experiments_to_analyse(&self) -> Result<Vec<Experiment>> {
        let experiments = self.experiments.experiments()?;
        match (&self.slugs, self.date) {
            (Slugs::All, RunDate::All) => Err(Error::InvalidInput(
                "Declining to re-run all experiments for all time".to_string(),
            )),
            (Slugs::All, RunDate::Single(date)) => Ok(experiments
                .end_on_or_after(date)
                .of_type(&RECOGNIZED_EXPERIMENT_TYPES)
                .experiments()
                .iter()
                .filter(|e| e.normandy_slug().is_some())
                .cloned()
                .collect()),
            (Slugs::List(slugs), _) => Ok(slugs
                .iter()
                .filter_map(|slug| {
                    let found = experiments.with_slug(slug).experiments().first().cloned();
                    if found.is_none() {
                        warn!(experiment = %slug, "Slug not found in the experiment registry; skipping");
                    }
                    found
                })
                .collect()),
        }
    }

    /// Dates to run `experiment` for.
    fn run_dates(&self, experiment: &Experiment) -> Vec<NaiveDate> {
        match self.date {
            RunDate::Single(date) => vec![date],
            RunDate::All => {
                let Some(start) = experiment.start_date() else {
                    warn!(experiment = experiment.experimenter_slug(), "No start date; nothing to rerun");
                    return Vec::new();
                };
                let today = self.current_day();
                let end = experiment
                    .end_date()
                    .map_or(today, |end| (end + Duration::days(1)).min(today));
                start.iter_days().take_while(|date| *date <= end).collect()
            }
        }
    }

    /// The (slug, date) pairs of this batch.
    ///
    /// # Errors
    ///
    /// See [`experiments_to_analyse`](Self::experiments_to_analyse).
    pub fn worklist(&self) -> Result<Vec<WorkItem>> {
        Ok(self.worklist_for(&self.experiments_to_analyse()?))
    }

    fn worklist_for(&self, experiments: &[Experiment]) -> Vec<WorkItem> {
        experiments
            .iter()
            .filter_map(|experiment| Some((experiment.normandy_slug()?, experiment)))
            .flat_map(|(slug, experiment)| {
                self.run_dates(experiment)
                    .into_iter()
                    .map(move |date| (slug.to_string(), date))
            })
            .collect()
    }

    /// Build the worklist and execute it with `strategy`.
    ///
    /// # Errors
    ///
    /// Returns error if the worklist cannot be built, an enrollment table
    /// cannot be deleted, or the strategy fails as a whole.
    pub fn execute(&self, strategy: &dyn ExecutorStrategy) -> Result<bool> {
        let experiments = self.experiments_to_analyse()?;
        let worklist = self.worklist_for(&experiments);
        if self.recreate_enrollments {
            for slug in experiments.iter().filter_map(Experiment::normandy_slug) {
                self.delete_enrollments(slug)?;
            }
        }
        info!(items = worklist.len(), experiments = experiments.len(), "Executing worklist");
        strategy.execute(&worklist, self.configuration_map.as_ref())
    }

    fn delete_enrollments(&self, slug: &str) -> Result<()> {
        let table = enrollments_table_name(slug);
        info!(experiment = slug, table = %table, "Deleting enrollments table");
        self.env.warehouse.delete_table(&table)
    }

    /// Make sure every selected experiment's enrollments table exists.
    ///
    /// Enrollments are ensured as of the run date, or for all dates as of
    /// the experiment's end date (bounded by today).
    ///
    /// # Errors
    ///
    /// The first failing experiment's error; remaining experiments are not
    /// processed.
    pub fn ensure_enrollments(&self) -> Result<()> {
        for experiment in self.experiments_to_analyse()? {
            if let Err(e) = self.ensure_enrollments_for(&experiment) {
                error!(
                    experiment = experiment.normandy_slug().unwrap_or_default(),
                    error = %e,
                    "Failed to ensure enrollments"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn ensure_enrollments_for(&self, experiment: &Experiment) -> Result<()> {
        if self.recreate_enrollments {
            if let Some(slug) = experiment.normandy_slug() {
                self.delete_enrollments(slug)?;
            }
        }
        let config = resolve_configuration(
            experiment,
            self.configuration_map.as_ref(),
            self.configs.as_ref(),
            &self.env,
        )?;
        let date = match self.date {
            RunDate::Single(date) => date,
            RunDate::All => {
                let today = self.current_day();
                experiment.end_date().map_or(today, |end| end.min(today))
            }
        };
        Analysis::new(self.env.clone(), config).ensure_enrollments(date)
    }
}
