//! Per-experiment analysis
//!
//! Toyota Way: Jidoka (stop on the first defect). Preconditions are
//! checked before any side effect; the first failing graph node fails the
//! whole run for that experiment.
//!
//! ## Run
//!
//! 1. [`Analysis::check_runnable`]
//! 2. [`Analysis::ensure_enrollments`] (skipped on dry runs)
//! 3. For every configured cadence with a newly closed window, add
//!    metric, subset, statistics, counts, and save nodes to one graph
//! 4. Execute the graph on the worker pool and block until it finishes

mod tasks;

pub use tasks::subset_segment;

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cadence::Cadence;
use crate::config::ExperimentConfiguration;
use crate::graph::{NodeOutput, Task, TaskGraph, WorkerPool};
use crate::naming::{app_id_to_dataset, enrollments_table_name, rolling_view_sql};
use crate::readiness::{analysis_length_dates, readiness, ExperimentSchedule};
use crate::sql::{
    with_stand_in_enrollments, DryRunner, EnrollmentsRequest, QueryBuilder, SqlParserDryRunner,
    TemplateQueryBuilder, STAND_IN_ENROLLMENTS_TABLE,
};
use crate::statistics::{StatisticRegistry, ALL_SEGMENT};
use crate::timelimits::{days_after, TimeLimits};
use crate::warehouse::{Labels, Warehouse, WriteMode};
use crate::{Error, Result};

/// Label on enrollment tables recording the enrollment period they cover.
pub const ENROLLMENT_LABEL: &str = "last_enrollment_date";

/// Analysis length used to validate experiments without an end date.
const VALIDATION_ANALYSIS_DAYS: i64 = 21;

/// Collaborators shared by every analysis in a process.
#[derive(Clone)]
pub struct AnalysisEnvironment {
    /// Warehouse holding every table
    pub warehouse: Arc<dyn Warehouse>,
    /// Enrollment and metric SQL
    pub queries: Arc<dyn QueryBuilder>,
    /// Statistics available to configurations
    pub statistics: Arc<StatisticRegistry>,
    /// Workers executing task graphs
    pub pool: Arc<WorkerPool>,
    /// Validation of generated SQL
    pub dry_runner: Arc<dyn DryRunner>,
}

impl AnalysisEnvironment {
    /// Default collaborators around `warehouse`, on the shared worker pool.
    ///
    /// # Errors
    ///
    /// Returns error if the shared worker pool cannot be started.
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Result<Self> {
        Ok(Self::with_pool(warehouse, WorkerPool::shared()?))
    }

    /// Default collaborators around `warehouse`, on `pool`.
    #[must_use]
    pub fn with_pool(warehouse: Arc<dyn Warehouse>, pool: Arc<WorkerPool>) -> Self {
        Self {
            warehouse,
            queries: Arc::new(TemplateQueryBuilder::new()),
            statistics: Arc::new(StatisticRegistry::default()),
            pool,
            dry_runner: Arc::new(SqlParserDryRunner::new()),
        }
    }

    /// Replace the query builder.
    #[must_use]
    pub fn queries(mut self, queries: Arc<dyn QueryBuilder>) -> Self {
        self.queries = queries;
        self
    }

    /// Replace the statistic registry.
    #[must_use]
    pub fn statistics(mut self, statistics: Arc<StatisticRegistry>) -> Self {
        self.statistics = statistics;
        self
    }

    /// Replace the dry runner.
    #[must_use]
    pub fn dry_runner(mut self, dry_runner: Arc<dyn DryRunner>) -> Self {
        self.dry_runner = dry_runner;
        self
    }
}

/// Analysis of one experiment, bound to one configuration.
pub struct Analysis {
    env: AnalysisEnvironment,
    config: ExperimentConfiguration,
}

impl Analysis {
    /// Create an analysis.
    #[must_use]
    pub const fn new(env: AnalysisEnvironment, config: ExperimentConfiguration) -> Self {
        Self { env, config }
    }

    /// The configuration being analysed.
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfiguration {
        &self.config
    }

    fn warehouse(&self) -> &dyn Warehouse {
        self.env.warehouse.as_ref()
    }

    fn slug(&self) -> Result<&str> {
        self.config.normandy_slug().ok_or_else(|| Error::NoSlug {
            experiment: self.config.experimenter_slug().to_string(),
        })
    }

    /// Check that the experiment can be analysed (on `current_date`).
    ///
    /// Checks, in order: slug, skip directive, population size,
    /// enrollment period, start date, and (given a date) end date.
    ///
    /// # Errors
    ///
    /// The first failing precondition; all are [`Error::is_expected`].
    pub fn check_runnable(&self, current_date: Option<NaiveDate>) -> Result<()> {
        let slug = self.slug()?.to_string();
        if self.config.skip() {
            return Err(Error::ExplicitSkip { slug });
        }
        if self.config.is_high_population() {
            return Err(Error::HighPopulation { slug });
        }
        self.enrollment_period()?;
        if self.config.start_date().is_none() {
            return Err(Error::NoStartDate { slug });
        }
        if let (Some(date), Some(end)) = (current_date, self.config.end_date()) {
            if end < date {
                return Err(Error::Ended { slug });
            }
        }
        Ok(())
    }

    /// Configured enrollment length in days.
    fn enrollment_period(&self) -> Result<u32> {
        match self.config.proposed_enrollment() {
            Some(days) if days > 0 => Ok(days),
            _ => Err(Error::NoEnrollmentPeriod {
                slug: self.slug()?.to_string(),
            }),
        }
    }

    /// Time limits if `cadence` has a newly closed window on `current_date`.
    ///
    /// # Errors
    ///
    /// See [`readiness`].
    pub fn timelimits_if_ready(
        &self,
        cadence: Cadence,
        current_date: NaiveDate,
    ) -> Result<Option<TimeLimits>> {
        readiness(cadence, &ExperimentSchedule::from(&self.config), current_date)
    }

    fn enrollments_sql(&self, slug: &str, time_limits: &TimeLimits) -> Result<String> {
        let app_dataset = app_id_to_dataset(self.config.app_id());
        self.env.queries.build_enrollments_query(&EnrollmentsRequest {
            experiment_slug: slug,
            app_dataset: &app_dataset,
            time_limits,
            query_type: self.config.platform().enrollments_query_type(),
            custom_query: self.config.enrollment_query(),
            segments: self.config.segments(),
        })
    }

    /// Make sure the enrollments table exists and covers the configured
    /// enrollment period.
    ///
    /// No-op until the first daily window has closed. An existing table
    /// for the same enrollment period is left alone; one created for a
    /// different period (the configuration changed since) is recreated.
    ///
    /// # Errors
    ///
    /// `NoEnrollmentPeriod` if no enrollment length is configured;
    /// otherwise any warehouse failure other than the table already
    /// existing.
    pub fn ensure_enrollments(&self, current_date: NaiveDate) -> Result<()> {
        let slug = self.slug()?;
        self.enrollment_period()?;
        let Some(time_limits) = self.timelimits_if_ready(Cadence::finest_periodic(), current_date)?
        else {
            info!(experiment = slug, "Skipping enrollments; not ready");
            return Ok(());
        };

        let table = enrollments_table_name(slug);
        let sql = self.enrollments_sql(slug, &time_limits)?;
        let covered = time_limits.last_enrollment_date().to_string();

        info!(experiment = slug, table = %table, "Creating enrollments table");
        if !self.create_if_absent(&sql, &table)? {
            let labels = self.warehouse().table_labels(&table)?;
            match labels.as_ref().and_then(|l| l.get(ENROLLMENT_LABEL)) {
                Some(existing) if *existing != covered => {
                    warn!(
                        experiment = slug,
                        table = %table,
                        "Enrollments table covers enrollment through {existing}, expected {covered}; recreating"
                    );
                    self.warehouse().delete_table(&table)?;
                    if !self.create_if_absent(&sql, &table)? {
                        debug!(experiment = slug, table = %table, "Enrollments table recreated by another run");
                        return Ok(());
                    }
                }
                _ => {
                    debug!(experiment = slug, table = %table, "Enrollments table already exists");
                    return Ok(());
                }
            }
        }

        let mut labels = Labels::new();
        labels.insert(ENROLLMENT_LABEL.to_string(), covered);
        self.warehouse().set_table_labels(&table, labels)
    }

    /// Write `sql` into `table` unless it already exists.
    ///
    /// Returns `false` when another writer got there first.
    fn create_if_absent(&self, sql: &str, table: &str) -> Result<bool> {
        match self.warehouse().execute(sql, Some(table), WriteMode::Empty) {
            Ok(()) => Ok(true),
            Err(Error::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop the enrollments table so the next run recreates it.
    ///
    /// # Errors
    ///
    /// Returns error if the table cannot be deleted.
    pub fn delete_enrollments(&self) -> Result<()> {
        let table = enrollments_table_name(self.slug()?);
        info!(experiment = self.config.log_slug(), table = %table, "Deleting enrollments table");
        self.warehouse().delete_table(&table)
    }

    /// Build the task graph for every cadence ready on `current_date`.
    ///
    /// On dry runs only the (logging) metric nodes are added.
    ///
    /// # Errors
    ///
    /// Returns error if readiness cannot be computed.
    pub fn build_graph(&self, current_date: NaiveDate, dry_run: bool) -> Result<TaskGraph> {
        let slug = self.slug()?;
        let mut builder = TaskGraph::builder();

        let segments: Vec<&str> = std::iter::once(ALL_SEGMENT)
            .chain(self.config.segments().iter().map(|s| s.name.as_str()))
            .collect();

        for (&cadence, summaries) in self.config.metrics() {
            let Some(time_limits) = self.timelimits_if_ready(cadence, current_date)? else {
                info!(experiment = slug, cadence = %cadence, "Skipping; not ready");
                continue;
            };

            let metrics = builder.add(
                Task::CalculateMetrics {
                    cadence,
                    time_limits,
                    dry_run,
                },
                &[],
            )?;
            if dry_run {
                info!(experiment = slug, cadence = %cadence, "Not calculating statistics; dry run");
                continue;
            }

            let load = builder.add(Task::LoadTable, &[metrics])?;
            let mut results = vec![metrics];
            for &segment in &segments {
                let subset = builder.add(
                    Task::SubsetSegment {
                        segment: segment.to_string(),
                    },
                    &[load],
                )?;
                for summary in summaries {
                    results.push(builder.add(
                        Task::Statistics {
                            summary: summary.clone(),
                            segment: segment.to_string(),
                        },
                        &[subset],
                    )?);
                }
                results.push(builder.add(
                    Task::Counts {
                        segment: segment.to_string(),
                    },
                    &[subset],
                )?);
            }
            builder.add(Task::SaveStatistics { cadence }, &results)?;
        }

        Ok(builder.build())
    }

    /// Analyse the experiment as of `current_date`.
    ///
    /// Returns the result tables of the windows that closed, whether or
    /// not they were actually written (dry runs write nothing).
    ///
    /// # Errors
    ///
    /// A precondition error, or the first failure of any stage.
    pub fn run(&self, current_date: NaiveDate, dry_run: bool) -> Result<Vec<String>> {
        info!(experiment = self.config.log_slug(), date = %current_date, dry_run, "Analysis run invoked");
        self.check_runnable(Some(current_date))?;

        if dry_run {
            info!(experiment = self.config.log_slug(), "Dry run; not creating enrollments");
        } else {
            self.ensure_enrollments(current_date)?;
        }

        let graph = self.build_graph(current_date, dry_run)?;
        if graph.is_empty() {
            return Ok(Vec::new());
        }
        let outputs = self.env.pool.execute(&graph, self)?;

        Ok(graph
            .nodes()
            .iter()
            .zip(&outputs)
            .filter(|(node, _)| matches!(node.task(), Task::CalculateMetrics { .. }))
            .filter_map(|(_, output)| output.as_table().map(str::to_string))
            .collect())
    }

    fn publish_view(&self, cadence: Cadence, prefix: Option<&str>) -> Result<()> {
        let sql = rolling_view_sql(
            self.warehouse().project(),
            self.warehouse().dataset(),
            self.slug()?,
            cadence,
            prefix,
        );
        self.warehouse().execute(&sql, None, WriteMode::Truncate)
    }

    /// Dry-run the enrollment and metric queries of every cadence.
    ///
    /// Writes nothing. Experiments without an end date are validated over
    /// a 21-day analysis period.
    ///
    /// # Errors
    ///
    /// A precondition error, `EnrollmentLongerThanAnalysis`, or
    /// `DryRunFailed` carrying the rejected SQL.
    pub fn validate(&self) -> Result<()> {
        self.check_runnable(None)?;
        let slug = self.slug()?;
        let start_date = self
            .config
            .start_date()
            .ok_or_else(|| Error::NoStartDate {
                slug: slug.to_string(),
            })?;
        let schedule = ExperimentSchedule::from(&self.config);
        let num_dates = schedule.num_dates_enrollment()?;

        let (end_date, analysis_length) = match self.config.end_date() {
            Some(end) => (end, analysis_length_dates(start_date, end, num_dates)),
            None => (
                days_after(
                    start_date,
                    VALIDATION_ANALYSIS_DAYS + i64::from(num_dates) - 1,
                )?,
                VALIDATION_ANALYSIS_DAYS,
            ),
        };
        if analysis_length <= 0 {
            warn!(experiment = slug, "Proposed enrollment longer than analysis dates length");
            return Err(Error::EnrollmentLongerThanAnalysis {
                slug: slug.to_string(),
            });
        }

        let limits = TimeLimits::for_single_analysis_window(
            start_date,
            end_date,
            0,
            analysis_length,
            num_dates,
        )?;

        self.env
            .dry_runner
            .dry_run(&self.enrollments_sql(slug, &limits)?)?;

        let metrics = self.config.all_metrics();
        if metrics.is_empty() {
            debug!(experiment = slug, "No metrics configured");
            return Ok(());
        }
        let metrics_sql =
            self.env
                .queries
                .build_metrics_query(&metrics, &limits, STAND_IN_ENROLLMENTS_TABLE)?;
        self.env
            .dry_runner
            .dry_run(&with_stand_in_enrollments(&metrics_sql))?;
        info!(experiment = slug, "Configuration is valid");
        Ok(())
    }
}

/// First input of a node.
fn first_input<'a>(inputs: &[&'a NodeOutput], task: &Task) -> Result<&'a NodeOutput> {
    inputs
        .first()
        .copied()
        .ok_or_else(|| Error::Other(format!("{} has no input", task.label())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisSpec;
    use crate::experiment::{Experiment, ExperimentStatus};
    use crate::warehouse::MemoryWarehouse;
    use arrow::array::StringArray;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use chrono::{DateTime, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn builder() -> crate::experiment::ExperimentBuilder {
        Experiment::builder("test-experiment")
            .normandy_slug(Some("test-experiment"))
            .experiment_type("rollout")
            .status(ExperimentStatus::Live)
            .start_date(date(2020, 3, 30))
            .end_date(date(2020, 6, 1))
            .proposed_enrollment(7)
            .branch("branch1", 0.5)
            .branch("branch2", 0.5)
            .reference_branch("branch2")
    }

    fn analysis_on(warehouse: Arc<dyn Warehouse>, experiment: &Experiment) -> Analysis {
        let config = AnalysisSpec::default_for_experiment(experiment)
            .unwrap()
            .resolve(experiment)
            .unwrap();
        let env = AnalysisEnvironment::with_pool(warehouse, Arc::new(WorkerPool::new(2).unwrap()));
        Analysis::new(env, config)
    }

    fn analysis(experiment: &Experiment) -> Analysis {
        analysis_on(Arc::new(MemoryWarehouse::new("project", "dataset")), experiment)
    }

    fn one_row() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("client_id", DataType::Utf8, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["a"]))]).unwrap()
    }

    /// Another run re-creates every table the moment it is deleted.
    struct RacingWarehouse {
        inner: MemoryWarehouse,
    }

    impl Warehouse for RacingWarehouse {
        fn project(&self) -> &str {
            self.inner.project()
        }

        fn dataset(&self) -> &str {
            self.inner.dataset()
        }

        fn execute(&self, sql: &str, destination: Option<&str>, write_mode: WriteMode) -> Result<()> {
            self.inner.execute(sql, destination, write_mode)
        }

        fn load_rows(&self, rows: &RecordBatch, destination: &str, write_mode: WriteMode) -> Result<()> {
            self.inner.load_rows(rows, destination, write_mode)
        }

        fn read_table(&self, table: &str) -> Result<RecordBatch> {
            self.inner.read_table(table)
        }

        fn delete_table(&self, table: &str) -> Result<()> {
            self.inner.delete_table(table)?;
            self.inner.insert_table(table, one_row());
            Ok(())
        }

        fn touch_tables(&self, slug: &str) -> Result<()> {
            self.inner.touch_tables(slug)
        }

        fn table_names(&self) -> Result<Vec<String>> {
            self.inner.table_names()
        }

        fn table_labels(&self, table: &str) -> Result<Option<Labels>> {
            self.inner.table_labels(table)
        }

        fn set_table_labels(&self, table: &str, labels: Labels) -> Result<()> {
            self.inner.set_table_labels(table, labels)
        }

        fn experiment_tables_first_updated(&self, slug: &str) -> Result<Option<DateTime<Utc>>> {
            self.inner.experiment_tables_first_updated(slug)
        }
    }

    #[test]
    fn test_check_runnable_order() {
        let slugless = analysis(&builder().normandy_slug(None).build());
        assert!(matches!(
            slugless.check_runnable(None),
            Err(Error::NoSlug { experiment }) if experiment == "test-experiment"
        ));

        let mut a = analysis(&builder().build());
        a.config.is_high_population = true;
        a.config.skip = true;
        assert!(matches!(a.check_runnable(None), Err(Error::ExplicitSkip { .. })));
        a.config.skip = false;
        assert!(matches!(a.check_runnable(None), Err(Error::HighPopulation { .. })));
        a.config.is_high_population = false;
        a.config.proposed_enrollment = None;
        assert!(matches!(a.check_runnable(None), Err(Error::NoEnrollmentPeriod { .. })));
        a.config.proposed_enrollment = Some(7);
        a.config.start_date = None;
        assert!(matches!(a.check_runnable(None), Err(Error::NoStartDate { .. })));
        a.config.start_date = Some(date(2020, 3, 30));
        assert!(a.check_runnable(Some(date(2020, 6, 1))).is_ok());
        assert!(matches!(
            a.check_runnable(Some(date(2020, 6, 2))),
            Err(Error::Ended { slug }) if slug == "test-experiment"
        ));
    }

    #[test]
    fn test_ensure_enrollments_requires_enrollment_period() {
        let warehouse = Arc::new(MemoryWarehouse::new("project", "dataset"));
        let experiment = Experiment::builder("test-experiment")
            .normandy_slug(Some("test-experiment"))
            .experiment_type("rollout")
            .status(ExperimentStatus::Live)
            .start_date(date(2020, 3, 30))
            .branch("branch1", 0.5)
            .branch("branch2", 0.5)
            .build();
        let a = analysis_on(Arc::clone(&warehouse) as Arc<dyn Warehouse>, &experiment);

        for current in [date(2020, 3, 31), date(2020, 4, 12)] {
            assert!(matches!(
                a.ensure_enrollments(current),
                Err(Error::NoEnrollmentPeriod { slug }) if slug == "test-experiment"
            ));
        }
        assert!(warehouse.is_empty());
        assert_eq!(warehouse.write_count(), 0);
    }

    #[test]
    fn test_enrollments_recreated_concurrently_is_not_an_error() {
        let warehouse = Arc::new(RacingWarehouse {
            inner: MemoryWarehouse::new("project", "dataset").with_query_handler(|_| Some(one_row())),
        });
        let table = enrollments_table_name("test-experiment");
        analysis_on(Arc::clone(&warehouse) as Arc<dyn Warehouse>, &builder().build())
            .ensure_enrollments(date(2020, 4, 12))
            .unwrap();
        let labels = warehouse.table_labels(&table).unwrap().unwrap();
        assert_eq!(labels.get(ENROLLMENT_LABEL).map(String::as_str), Some("2020-04-06"));

        // Stale label; the table reappears between delete and re-create
        let shorter = builder().proposed_enrollment(5).build();
        analysis_on(Arc::clone(&warehouse) as Arc<dyn Warehouse>, &shorter)
            .ensure_enrollments(date(2020, 4, 12))
            .unwrap();
        let labels = warehouse.table_labels(&table).unwrap().unwrap();
        assert!(labels.get(ENROLLMENT_LABEL).is_none());
    }

    #[test]
    fn test_graph_shape() {
        let a = analysis(&builder().build());
        let graph = a.build_graph(date(2020, 4, 12), false).unwrap();
        // weekly: metrics, load, subset(all), 3 statistics, counts, save
        assert_eq!(graph.len(), 8);
        assert!(matches!(
            graph.nodes().last().map(|n| n.task()),
            Some(Task::SaveStatistics { cadence: Cadence::Week })
        ));
        assert_eq!(graph.nodes()[7].dependencies().len(), 5);
    }

    #[test]
    fn test_dry_run_graph_only_has_metric_nodes() {
        let a = analysis(&builder().build());
        let graph = a.build_graph(date(2020, 4, 12), true).unwrap();
        assert_eq!(graph.len(), 1);
        assert!(a.build_graph(date(2020, 4, 13), true).unwrap().is_empty());
    }

    #[test]
    fn test_validate() {
        analysis(&builder().build()).validate().unwrap();
        let open_ended = Experiment::builder("open")
            .normandy_slug(Some("open"))
            .start_date(date(2020, 3, 30))
            .proposed_enrollment(7)
            .build();
        analysis(&open_ended).validate().unwrap();
    }

    #[test]
    fn test_validate_enrollment_longer_than_analysis() {
        let short = builder().end_date(date(2020, 4, 2)).build();
        assert!(matches!(
            analysis(&short).validate(),
            Err(Error::EnrollmentLongerThanAnalysis { .. })
        ));
    }
}
