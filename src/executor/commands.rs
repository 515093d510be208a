//! Batch entry points
//!
//! Each command returns whether the batch succeeded; a binary maps that to
//! its exit status.

use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{
    today, AnalysisExecutor, ConfigurationMap, ExecutorStrategy, RemoteExecutorStrategy, RunDate,
    SerialExecutorStrategy, Slugs,
};
use crate::analysis::{Analysis, AnalysisEnvironment};
use crate::config::{AnalysisSpec, ExternalConfig, ExternalConfigSource};
use crate::experiment::ExperimentSource;
use crate::export::{export_statistics_tables, ObjectStore};
use crate::{Error, Result};

/// Collaborators shared by all commands.
#[derive(Clone)]
pub struct Commands {
    env: AnalysisEnvironment,
    experiments: Arc<dyn ExperimentSource>,
    configs: Arc<dyn ExternalConfigSource>,
    store: Arc<dyn ObjectStore>,
}

impl Commands {
    /// Create the command set.
    #[must_use]
    pub fn new(
        env: AnalysisEnvironment,
        experiments: Arc<dyn ExperimentSource>,
        configs: Arc<dyn ExternalConfigSource>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            env,
            experiments,
            configs,
            store,
        }
    }

    fn serial(&self) -> SerialExecutorStrategy {
        SerialExecutorStrategy::new(
            self.env.clone(),
            Arc::clone(&self.experiments),
            Arc::clone(&self.configs),
        )
        .metadata_store(Arc::clone(&self.store))
    }

    fn executor(&self, date: RunDate, slugs: Slugs) -> AnalysisExecutor {
        AnalysisExecutor::new(
            self.env.clone(),
            Arc::clone(&self.experiments),
            Arc::clone(&self.configs),
            date,
            slugs,
        )
    }

    /// Analyse one experiment (or all running ones) for `date`.
    ///
    /// `config` replaces the external config of `slug`.
    ///
    /// # Errors
    ///
    /// Returns error if the worklist cannot be built.
    pub fn run(
        &self,
        date: NaiveDate,
        slug: Option<&str>,
        config: Option<AnalysisSpec>,
        recreate_enrollments: bool,
    ) -> Result<bool> {
        let mut executor = self
            .executor(RunDate::Single(date), slugs(slug))
            .recreate_enrollments(recreate_enrollments);
        if let Some(map) = configuration_map(slug, config) {
            executor = executor.configuration_map(map);
        }
        executor.execute(&self.serial())
    }

    /// Like [`run`](Self::run), executed by a remote workflow.
    ///
    /// # Errors
    ///
    /// Returns error if the worklist cannot be built or submission fails.
    pub fn run_remote(
        &self,
        strategy: &RemoteExecutorStrategy,
        date: NaiveDate,
        slug: Option<&str>,
        recreate_enrollments: bool,
    ) -> Result<bool> {
        self.executor(RunDate::Single(date), slugs(slug))
            .recreate_enrollments(recreate_enrollments)
            .execute(strategy)
    }

    /// Rerun every available date of one experiment, then refresh its
    /// tables' metadata.
    ///
    /// Runs in process unless `remote` is given.
    ///
    /// # Errors
    ///
    /// Returns error if the worklist cannot be built, execution fails as a
    /// whole, or the tables cannot be touched.
    pub fn rerun(
        &self,
        slug: &str,
        config: Option<AnalysisSpec>,
        remote: Option<&RemoteExecutorStrategy>,
        recreate_enrollments: bool,
    ) -> Result<bool> {
        let mut executor = self
            .executor(RunDate::All, Slugs::List(vec![slug.to_string()]))
            .recreate_enrollments(recreate_enrollments);
        if let Some(map) = configuration_map(Some(slug), config) {
            executor = executor.configuration_map(map);
        }
        let success = match remote {
            Some(strategy) => executor.execute(strategy)?,
            None => executor.execute(&self.serial())?,
        };
        self.env.warehouse.touch_tables(slug)?;
        Ok(success)
    }

    /// Rerun every experiment whose external config changed after its
    /// tables were last updated.
    ///
    /// # Errors
    ///
    /// Returns error if configs or table metadata cannot be read, or
    /// execution fails as a whole.
    pub fn rerun_config_changed(
        &self,
        remote: Option<&RemoteExecutorStrategy>,
        recreate_enrollments: bool,
    ) -> Result<bool> {
        let configs = self.configs.configs()?;
        let updated: Vec<String> = configs
            .updated_configs(self.env.warehouse.as_ref())?
            .into_iter()
            .map(|config| config.slug.clone())
            .collect();
        if updated.is_empty() {
            info!("No updated configs");
            return Ok(true);
        }
        info!(experiments = ?updated, "Rerunning experiments with updated configs");

        let executor = self
            .executor(RunDate::All, Slugs::List(updated.clone()))
            .recreate_enrollments(recreate_enrollments);
        let serial = self.serial();
        let strategy: &dyn ExecutorStrategy = match remote {
            Some(strategy) => strategy,
            None => &serial,
        };
        let success = executor.execute(strategy)?;

        for slug in &updated {
            self.env.warehouse.touch_tables(slug)?;
        }
        Ok(success)
    }

    /// Create (or recreate) enrollment tables as of today.
    ///
    /// # Errors
    ///
    /// The first experiment's failure.
    pub fn ensure_enrollments(
        &self,
        slug: Option<&str>,
        config: Option<AnalysisSpec>,
        recreate_enrollments: bool,
    ) -> Result<()> {
        let mut executor = self
            .executor(RunDate::Single(today()), slugs(slug))
            .recreate_enrollments(recreate_enrollments);
        if let Some(map) = configuration_map(slug, config) {
            executor = executor.configuration_map(map);
        }
        executor.ensure_enrollments()
    }

    /// Dry-run the experiment config files at `paths`.
    ///
    /// Directories and `*.example.toml` files are skipped. Returns `false`
    /// if any config is invalid or names an unknown experiment.
    ///
    /// # Errors
    ///
    /// Returns error if the experiment registry cannot be read.
    pub fn validate_config(&self, paths: &[PathBuf]) -> Result<bool> {
        let experiments = self.experiments.experiments()?;
        let mut dirty = false;

        for path in paths {
            if !path.is_file() {
                continue;
            }
            if is_example(path) {
                info!(path = %path.display(), "Skipping example config");
                continue;
            }
            info!(path = %path.display(), "Evaluating config");

            let result = ExternalConfig::from_path(path).and_then(|external| {
                let experiment = experiments
                    .with_slug(&external.slug)
                    .experiments()
                    .first()
                    .cloned()
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "No experiment with slug {} in the experiment registry",
                            external.slug
                        ))
                    })?;
                let mut spec = AnalysisSpec::default_for_experiment(&experiment)?;
                spec.merge(external.spec);
                let config = spec.resolve_with(&experiment, &self.env.statistics)?;
                Analysis::new(self.env.clone(), config).validate()
            });

            match result {
                Ok(()) => {}
                Err(Error::ExplicitSkip { slug }) => {
                    info!(experiment = %slug, "Found an explicit skip directive; will ignore this experiment");
                }
                Err(e) => {
                    if let Some(sql) = e.annotated_sql() {
                        error!(path = %path.display(), "Error evaluating SQL:\n{sql}");
                    }
                    error!(path = %path.display(), error = %e, "Invalid config");
                    dirty = true;
                }
            }
        }
        Ok(!dirty)
    }

    /// Export one experiment's statistics tables; returns the keys written.
    ///
    /// # Errors
    ///
    /// Returns error if a table cannot be read or exported.
    pub fn export_statistics(&self, slug: &str) -> Result<Vec<String>> {
        let keys = export_statistics_tables(self.env.warehouse.as_ref(), self.store.as_ref(), slug)?;
        if keys.is_empty() {
            warn!(experiment = slug, "No statistics tables to export");
        }
        Ok(keys)
    }
}

fn slugs(slug: Option<&str>) -> Slugs {
    slug.map_or(Slugs::All, |slug| Slugs::List(vec![slug.to_string()]))
}

fn configuration_map(slug: Option<&str>, config: Option<AnalysisSpec>) -> Option<ConfigurationMap> {
    let (slug, config) = (slug?, config?);
    Some(ConfigurationMap::from([(slug.to_string(), config)]))
}

fn is_example(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.split('.').skip(1).any(|part| part == "example"))
}
