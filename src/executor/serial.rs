//! In-process execution, one experiment after another

use std::sync::Arc;
use tracing::{error, info, warn};

use super::{resolve_configuration, ConfigurationMap, ExecutorStrategy, WorkItem};
use crate::analysis::{Analysis, AnalysisEnvironment};
use crate::config::ExternalConfigSource;
use crate::experiment::{ExperimentCollection, ExperimentSource};
use crate::export::{export_metadata, ObjectStore};
use crate::{Error, Result};

/// Runs each work item in this process.
///
/// Each experiment's own task graph still runs concurrently on the
/// environment's worker pool.
pub struct SerialExecutorStrategy {
    env: AnalysisEnvironment,
    experiments: Arc<dyn ExperimentSource>,
    configs: Arc<dyn ExternalConfigSource>,
    store: Option<Arc<dyn ObjectStore>>,
    dry_run: bool,
}

impl SerialExecutorStrategy {
    /// Create a strategy.
    #[must_use]
    pub fn new(
        env: AnalysisEnvironment,
        experiments: Arc<dyn ExperimentSource>,
        configs: Arc<dyn ExternalConfigSource>,
    ) -> Self {
        Self {
            env,
            experiments,
            configs,
            store: None,
            dry_run: false,
        }
    }

    /// Export experiment metadata to `store` after each successful run.
    #[must_use]
    pub fn metadata_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build graphs without computing anything.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn run_one(
        &self,
        experiments: &ExperimentCollection,
        slug: &str,
        date: chrono::NaiveDate,
        configuration_map: Option<&ConfigurationMap>,
    ) -> Result<()> {
        let experiment = experiments
            .with_slug(slug)
            .experiments()
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("Experiment {slug} not found")))?;
        let config = resolve_configuration(
            &experiment,
            configuration_map,
            self.configs.as_ref(),
            &self.env,
        )?;
        let analysis = Analysis::new(self.env.clone(), config);
        analysis.run(date, self.dry_run)?;
        if let Some(store) = &self.store {
            export_metadata(analysis.config(), store.as_ref())?;
        }
        Ok(())
    }
}

impl ExecutorStrategy for SerialExecutorStrategy {
    fn execute(
        &self,
        worklist: &[WorkItem],
        configuration_map: Option<&ConfigurationMap>,
    ) -> Result<bool> {
        let experiments = self.experiments.experiments()?;
        let mut failed = false;
        for (slug, date) in worklist {
            match self.run_one(&experiments, slug, *date, configuration_map) {
                Ok(()) => info!(experiment = %slug, date = %date, "Analysis finished"),
                // Expected outcomes must not fail (and so retry) the batch
                Err(e) if e.is_expected() => {
                    warn!(experiment = %slug, date = %date, error = %e, "Analysis skipped");
                }
                Err(e) => {
                    failed = true;
                    if let Some(sql) = e.annotated_sql() {
                        error!(experiment = %slug, "Failing SQL:\n{sql}");
                    }
                    error!(experiment = %slug, date = %date, error = %e, "Analysis failed");
                }
            }
        }
        Ok(!failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisSpec, ExternalConfigCollection};
    use crate::experiment::Experiment;
    use crate::export::LocalObjectStore;
    use crate::graph::WorkerPool;
    use crate::warehouse::MemoryWarehouse;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn strategy(warehouse: Arc<MemoryWarehouse>) -> SerialExecutorStrategy {
        let experiments = ExperimentCollection::new(vec![
            Experiment::builder("skipped")
                .start_date(date(2020, 1, 1))
                .proposed_enrollment(7)
                .build(),
            Experiment::builder("no-enrollment")
                .start_date(date(2020, 1, 1))
                .build(),
        ]);
        let env = AnalysisEnvironment::with_pool(warehouse, Arc::new(WorkerPool::new(1).unwrap()));
        SerialExecutorStrategy::new(
            env,
            Arc::new(experiments),
            Arc::new(ExternalConfigCollection::default()),
        )
    }

    #[test]
    fn test_expected_errors_do_not_fail_batch() {
        let warehouse = Arc::new(MemoryWarehouse::new("p", "d"));
        let mut map = ConfigurationMap::new();
        map.insert(
            "skipped".to_string(),
            AnalysisSpec::from_toml("[experiment]\nskip = true\n").unwrap(),
        );
        let worklist = vec![
            ("skipped".to_string(), date(2020, 1, 20)),
            ("no-enrollment".to_string(), date(2020, 1, 20)),
        ];
        assert!(strategy(Arc::clone(&warehouse))
            .execute(&worklist, Some(&map))
            .unwrap());
        assert_eq!(warehouse.write_count(), 0);
    }

    #[test]
    fn test_unknown_experiment_fails_batch() {
        let warehouse = Arc::new(MemoryWarehouse::new("p", "d"));
        let worklist = vec![("missing".to_string(), date(2020, 1, 20))];
        assert!(!strategy(warehouse).execute(&worklist, None).unwrap());
    }

    #[test]
    fn test_metadata_exported_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::new("p", "d"));
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let strategy = strategy(Arc::clone(&warehouse))
            .metadata_store(store.clone())
            .dry_run(true);
        let worklist = vec![("skipped".to_string(), date(2020, 1, 2))];
        assert!(strategy.execute(&worklist, None).unwrap());
        assert!(store.get("metadata/metadata_skipped.json").is_ok());
        assert_eq!(warehouse.write_count(), 0);
    }
}
