//! Analysis spec - the mergeable, file-level form of configuration

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{DataSource, ExperimentConfiguration, Metric, Platform, Segment, StatisticSpec, Summary};
use crate::cadence::Cadence;
use crate::experiment::Experiment;
use crate::naming::app_id_to_dataset;
use crate::statistics::StatisticRegistry;
use crate::{Error, Result};

/// Structural merge where the incoming value wins key by key.
trait Merge {
    fn merge(&mut self, other: Self);
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn merge_definitions<T: Merge>(base: &mut BTreeMap<String, T>, other: BTreeMap<String, T>) {
    for (name, definition) in other {
        match base.get_mut(&name) {
            Some(existing) => existing.merge(definition),
            None => {
                base.insert(name, definition);
            }
        }
    }
}

fn union(base: &mut Vec<String>, other: Vec<String>) {
    for name in other {
        if !base.contains(&name) {
            base.push(name);
        }
    }
}

/// `[experiment]` overrides of registry metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSpec {
    /// Custom enrollment SQL
    pub enrollment_query: Option<String>,
    /// Segments to analyse
    pub segments: Vec<String>,
    /// Skip this experiment entirely
    pub skip: Option<bool>,
    /// Start date override
    pub start_date: Option<NaiveDate>,
    /// End date override
    pub end_date: Option<NaiveDate>,
    /// Enrollment period override, in days
    pub enrollment_period: Option<u32>,
    /// Reference branch override
    pub reference_branch: Option<String>,
}

impl Merge for ExperimentSpec {
    fn merge(&mut self, other: Self) {
        override_with(&mut self.enrollment_query, other.enrollment_query);
        union(&mut self.segments, other.segments);
        override_with(&mut self.skip, other.skip);
        override_with(&mut self.start_date, other.start_date);
        override_with(&mut self.end_date, other.end_date);
        override_with(&mut self.enrollment_period, other.enrollment_period);
        override_with(&mut self.reference_branch, other.reference_branch);
    }
}

/// `[metrics.<name>]` definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricDefinition {
    /// Data source name
    pub data_source: Option<String>,
    /// Aggregate SQL expression
    pub select_expression: Option<String>,
    /// Human-readable name
    pub friendly_name: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Statistics by name, with parameters
    pub statistics: BTreeMap<String, toml::Table>,
}

impl Merge for MetricDefinition {
    fn merge(&mut self, other: Self) {
        override_with(&mut self.data_source, other.data_source);
        override_with(&mut self.select_expression, other.select_expression);
        override_with(&mut self.friendly_name, other.friendly_name);
        override_with(&mut self.description, other.description);
        for (name, params) in other.statistics {
            self.statistics.entry(name).or_default().extend(params);
        }
    }
}

/// `[metrics]`: cadence lists plus metric definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSpec {
    /// Metrics analysed daily
    pub daily: Vec<String>,
    /// Metrics analysed weekly
    pub weekly: Vec<String>,
    /// Metrics analysed every 28 days
    #[serde(rename = "28_day")]
    pub days28: Vec<String>,
    /// Metrics analysed once the experiment completes
    pub overall: Vec<String>,
    /// Metric definitions by name
    #[serde(flatten)]
    pub definitions: BTreeMap<String, MetricDefinition>,
}

impl MetricsSpec {
    /// Metric names configured for a cadence.
    #[must_use]
    pub fn names_for(&self, cadence: Cadence) -> &[String] {
        match cadence {
            Cadence::Day => &self.daily,
            Cadence::Week => &self.weekly,
            Cadence::Days28 => &self.days28,
            Cadence::Overall => &self.overall,
        }
    }
}

impl Merge for MetricsSpec {
    fn merge(&mut self, other: Self) {
        union(&mut self.daily, other.daily);
        union(&mut self.weekly, other.weekly);
        union(&mut self.days28, other.days28);
        union(&mut self.overall, other.overall);
        merge_definitions(&mut self.definitions, other.definitions);
    }
}

/// `[data_sources.<name>]` definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceDefinition {
    /// SQL `FROM` expression; `{dataset}` expands to the app's dataset
    pub from_expression: Option<String>,
    /// Client id column (default `client_id`)
    pub client_id_column: Option<String>,
    /// Submission date column (default `submission_date`)
    pub submission_date_column: Option<String>,
}

impl Merge for DataSourceDefinition {
    fn merge(&mut self, other: Self) {
        override_with(&mut self.from_expression, other.from_expression);
        override_with(&mut self.client_id_column, other.client_id_column);
        override_with(&mut self.submission_date_column, other.submission_date_column);
    }
}

impl DataSourceDefinition {
    fn resolve(&self, name: &str, dataset: &str) -> Result<DataSource> {
        let from_expression = self
            .from_expression
            .as_deref()
            .ok_or_else(|| Error::Config(format!("Data source {name} has no from_expression")))?;
        Ok(DataSource {
            name: name.to_string(),
            from_expression: from_expression.replace("{dataset}", dataset),
            client_id_column: self
                .client_id_column
                .clone()
                .unwrap_or_else(|| "client_id".to_string()),
            submission_date_column: self
                .submission_date_column
                .clone()
                .unwrap_or_else(|| "submission_date".to_string()),
        })
    }
}

/// `[segments.<name>]` definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentDefinition {
    /// Data source name
    pub data_source: Option<String>,
    /// Aggregate SQL expression yielding a boolean
    pub select_expression: Option<String>,
}

impl Merge for SegmentDefinition {
    fn merge(&mut self, other: Self) {
        override_with(&mut self.data_source, other.data_source);
        override_with(&mut self.select_expression, other.select_expression);
    }
}

/// `[segments]`: segment definitions plus their data sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentsSpec {
    /// Segment data sources by name
    pub data_sources: BTreeMap<String, DataSourceDefinition>,
    /// Segment definitions by name
    #[serde(flatten)]
    pub definitions: BTreeMap<String, SegmentDefinition>,
}

impl Merge for SegmentsSpec {
    fn merge(&mut self, other: Self) {
        merge_definitions(&mut self.data_sources, other.data_sources);
        merge_definitions(&mut self.definitions, other.definitions);
    }
}

/// A complete analysis spec, as read from one TOML file.
///
/// # Example
///
/// ```
/// use trueno_analysis::config::AnalysisSpec;
///
/// let mut spec = AnalysisSpec::from_toml(r#"
///     [metrics]
///     weekly = ["spam"]
///
///     [metrics.spam]
///     data_source = "main"
///     select_expression = "1"
///
///     [metrics.spam.statistics.mean]
/// "#)?;
/// spec.merge(AnalysisSpec::from_toml(r#"
///     [metrics.spam]
///     select_expression = "2"
/// "#)?);
///
/// let spam = &spec.metrics.definitions["spam"];
/// assert_eq!(spam.select_expression.as_deref(), Some("2"));
/// assert_eq!(spam.data_source.as_deref(), Some("main"));
/// # Ok::<(), trueno_analysis::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSpec {
    /// Experiment metadata overrides
    pub experiment: ExperimentSpec,
    /// Metric lists and definitions
    pub metrics: MetricsSpec,
    /// Data source definitions
    pub data_sources: BTreeMap<String, DataSourceDefinition>,
    /// Segment definitions
    pub segments: SegmentsSpec,
}

impl AnalysisSpec {
    /// Parse a spec from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `Toml` if the text does not match the analysis spec layout.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Parse a spec from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Platform defaults for an experiment (empty if the platform has none).
    ///
    /// # Errors
    ///
    /// Returns error for unknown platforms.
    pub fn default_for_experiment(experiment: &Experiment) -> Result<Self> {
        let platform = Platform::for_app_name(experiment.app_name())?;
        platform
            .default_spec_toml()
            .map_or_else(|| Ok(Self::default()), Self::from_toml)
    }

    /// Merge `other` into `self`; `other` wins wherever both define a key.
    pub fn merge(&mut self, other: Self) {
        self.experiment.merge(other.experiment);
        self.metrics.merge(other.metrics);
        merge_definitions(&mut self.data_sources, other.data_sources);
        self.segments.merge(other.segments);
    }

    /// Resolve against experiment metadata using the built-in statistics.
    ///
    /// # Errors
    ///
    /// See [`resolve_with`](Self::resolve_with).
    pub fn resolve(&self, experiment: &Experiment) -> Result<ExperimentConfiguration> {
        self.resolve_with(experiment, &StatisticRegistry::default())
    }

    /// Resolve against experiment metadata.
    ///
    /// # Errors
    ///
    /// Returns `Config` for undefined metrics, data sources, or segments,
    /// and `UnknownStatistic` for statistics missing from `registry`.
    pub fn resolve_with(
        &self,
        experiment: &Experiment,
        registry: &StatisticRegistry,
    ) -> Result<ExperimentConfiguration> {
        let platform = Platform::for_app_name(experiment.app_name())?;
        let dataset = app_id_to_dataset(experiment.app_id());

        let segments = self
            .experiment
            .segments
            .iter()
            .map(|name| self.resolve_segment(name, &dataset))
            .collect::<Result<Vec<_>>>()?;

        let mut metrics = BTreeMap::new();
        for cadence in Cadence::ALL {
            let mut summaries = Vec::new();
            let mut seen = Vec::new();
            for name in self.metrics.names_for(cadence) {
                if seen.contains(&name) {
                    continue;
                }
                seen.push(name);
                summaries.extend(self.resolve_metric(name, &dataset, registry)?);
            }
            if !summaries.is_empty() {
                metrics.insert(cadence, summaries);
            }
        }

        Ok(ExperimentConfiguration {
            experimenter_slug: experiment.experimenter_slug().to_string(),
            normandy_slug: experiment.normandy_slug().map(str::to_string),
            experiment_type: experiment.experiment_type().to_string(),
            status: experiment.status(),
            start_date: self.experiment.start_date.or(experiment.start_date()),
            end_date: self.experiment.end_date.or(experiment.end_date()),
            proposed_enrollment: self
                .experiment
                .enrollment_period
                .or(experiment.proposed_enrollment()),
            branches: experiment.branches().to_vec(),
            reference_branch: self
                .experiment
                .reference_branch
                .clone()
                .or_else(|| experiment.reference_branch().map(str::to_string)),
            is_high_population: experiment.is_high_population(),
            skip: self.experiment.skip.unwrap_or(false),
            enrollment_query: self.experiment.enrollment_query.clone(),
            segments,
            platform,
            app_id: experiment.app_id().to_string(),
            metrics,
        })
    }

    fn data_source(&self, name: &str, dataset: &str) -> Result<DataSource> {
        self.data_sources
            .get(name)
            .ok_or_else(|| Error::Config(format!("Data source {name} is not defined")))?
            .resolve(name, dataset)
    }

    fn resolve_metric(
        &self,
        name: &str,
        dataset: &str,
        registry: &StatisticRegistry,
    ) -> Result<Vec<Summary>> {
        let definition = self
            .metrics
            .definitions
            .get(name)
            .ok_or_else(|| Error::Config(format!("No definition for metric {name}")))?;
        let select_expression = definition
            .select_expression
            .clone()
            .ok_or_else(|| Error::Config(format!("Metric {name} has no select_expression")))?;
        let data_source_name = definition
            .data_source
            .as_deref()
            .ok_or_else(|| Error::Config(format!("Metric {name} has no data_source")))?;
        if definition.statistics.is_empty() {
            return Err(Error::Config(format!("Metric {name} has no statistics")));
        }

        let metric = Metric {
            name: name.to_string(),
            select_expression,
            data_source: self.data_source(data_source_name, dataset)?,
            friendly_name: definition.friendly_name.clone(),
            description: definition.description.clone(),
        };

        definition
            .statistics
            .iter()
            .map(|(statistic, params)| {
                if !registry.contains(statistic) {
                    return Err(Error::UnknownStatistic(statistic.clone()));
                }
                Ok(Summary {
                    metric: metric.clone(),
                    statistic: StatisticSpec {
                        name: statistic.clone(),
                        params: serde_json::to_value(params)?,
                    },
                })
            })
            .collect()
    }

    fn resolve_segment(&self, name: &str, dataset: &str) -> Result<Segment> {
        let definition = self
            .segments
            .definitions
            .get(name)
            .ok_or_else(|| Error::Config(format!("Segment {name} is not defined")))?;
        let select_expression = definition
            .select_expression
            .clone()
            .ok_or_else(|| Error::Config(format!("Segment {name} has no select_expression")))?;
        let data_source_name = definition
            .data_source
            .as_deref()
            .ok_or_else(|| Error::Config(format!("Segment {name} has no data_source")))?;
        let data_source = match self.segments.data_sources.get(data_source_name) {
            Some(source) => source.resolve(data_source_name, dataset)?,
            None => self.data_source(data_source_name, dataset)?,
        };
        Ok(Segment {
            name: name.to_string(),
            select_expression,
            data_source,
        })
    }
}
