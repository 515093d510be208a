//! Statistics over metric tables
//!
//! A [`Statistic`] turns one metric column of a (segment-subset) metrics
//! frame into [`StatisticResult`] rows. Statistics are looked up by name in
//! a [`StatisticRegistry`] so configuration files can refer to them.
//!
//! ## Result rows
//!
//! | Column                 | Type    | Notes                                   |
//! |------------------------|---------|-----------------------------------------|
//! | `metric`               | Utf8    | metric name, `identity` for counts      |
//! | `statistic`            | Utf8    | registry name                           |
//! | `parameter`            | Float64 | nullable                                |
//! | `branch`               | Utf8    |                                         |
//! | `comparison`           | Utf8    | `difference`, `relative_uplift`, null   |
//! | `comparison_to_branch` | Utf8    | reference branch of a comparison        |
//! | `ci_width`             | Float64 | confidence level of `lower`/`upper`     |
//! | `point`                | Float64 |                                         |
//! | `lower`, `upper`       | Float64 | nullable                                |
//! | `segment`              | Utf8    | `all` or a segment name                 |

mod count;
mod mean;

pub use count::{counts, COUNT_METRIC, COUNT_STATISTIC};
pub use mean::Mean;

use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{ExperimentConfiguration, StatisticSpec};
use crate::{Error, Result};

/// Segment label covering every enrolled client.
pub const ALL_SEGMENT: &str = "all";

/// One row of statistics output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticResult {
    /// Metric name
    pub metric: String,
    /// Statistic name
    pub statistic: String,
    /// Statistic parameter, if any
    pub parameter: Option<f64>,
    /// Branch the row describes
    pub branch: String,
    /// Comparison kind, for rows relative to another branch
    pub comparison: Option<String>,
    /// Branch compared against
    pub comparison_to_branch: Option<String>,
    /// Confidence level of the interval
    pub ci_width: Option<f64>,
    /// Point estimate
    pub point: f64,
    /// Lower interval bound
    pub lower: Option<f64>,
    /// Upper interval bound
    pub upper: Option<f64>,
    /// Segment label
    pub segment: String,
}

impl StatisticResult {
    /// A per-branch row with no comparison or interval.
    #[must_use]
    pub fn point(metric: &str, statistic: &str, branch: &str, point: f64) -> Self {
        Self {
            metric: metric.to_string(),
            statistic: statistic.to_string(),
            parameter: None,
            branch: branch.to_string(),
            comparison: None,
            comparison_to_branch: None,
            ci_width: None,
            point,
            lower: None,
            upper: None,
            segment: ALL_SEGMENT.to_string(),
        }
    }

    /// Attach a confidence interval.
    #[must_use]
    pub fn with_interval(mut self, ci_width: f64, lower: f64, upper: f64) -> Self {
        self.ci_width = Some(ci_width);
        self.lower = Some(lower);
        self.upper = Some(upper);
        self
    }

    /// Mark as a comparison against `branch`.
    #[must_use]
    pub fn with_comparison(mut self, comparison: &str, branch: &str) -> Self {
        self.comparison = Some(comparison.to_string());
        self.comparison_to_branch = Some(branch.to_string());
        self
    }

    /// Arrow schema of statistics tables.
    #[must_use]
    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("metric", DataType::Utf8, false),
            Field::new("statistic", DataType::Utf8, false),
            Field::new("parameter", DataType::Float64, true),
            Field::new("branch", DataType::Utf8, false),
            Field::new("comparison", DataType::Utf8, true),
            Field::new("comparison_to_branch", DataType::Utf8, true),
            Field::new("ci_width", DataType::Float64, true),
            Field::new("point", DataType::Float64, false),
            Field::new("lower", DataType::Float64, true),
            Field::new("upper", DataType::Float64, true),
            Field::new("segment", DataType::Utf8, false),
        ]))
    }

    /// Build a record batch from rows.
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the columns.
    pub fn to_record_batch(rows: &[Self]) -> Result<RecordBatch> {
        let strings = |f: fn(&Self) -> &str| -> ArrayRef {
            Arc::new(rows.iter().map(f).map(Some).collect::<StringArray>())
        };
        let optional_strings = |f: fn(&Self) -> Option<&str>| -> ArrayRef {
            Arc::new(rows.iter().map(f).collect::<StringArray>())
        };
        let floats = |f: fn(&Self) -> Option<f64>| -> ArrayRef {
            Arc::new(rows.iter().map(f).collect::<Float64Array>())
        };

        let columns = vec![
            strings(|r| r.metric.as_str()),
            strings(|r| r.statistic.as_str()),
            floats(|r| r.parameter),
            strings(|r| r.branch.as_str()),
            optional_strings(|r| r.comparison.as_deref()),
            optional_strings(|r| r.comparison_to_branch.as_deref()),
            floats(|r| r.ci_width),
            floats(|r| Some(r.point)),
            floats(|r| r.lower),
            floats(|r| r.upper),
            strings(|r| r.segment.as_str()),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    /// Read rows back from a statistics table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a column is missing or has the wrong type.
    pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let metric = string_column(batch, "metric")?;
        let statistic = string_column(batch, "statistic")?;
        let parameter = float_column(batch, "parameter")?;
        let branch = string_column(batch, "branch")?;
        let comparison = string_column(batch, "comparison")?;
        let comparison_to_branch = string_column(batch, "comparison_to_branch")?;
        let ci_width = float_column(batch, "ci_width")?;
        let point = float_column(batch, "point")?;
        let lower = float_column(batch, "lower")?;
        let upper = float_column(batch, "upper")?;
        let segment = string_column(batch, "segment")?;

        let text = |column: &StringArray, i: usize| {
            column.is_valid(i).then(|| column.value(i).to_string())
        };
        let number = |column: &Float64Array, i: usize| column.is_valid(i).then(|| column.value(i));

        Ok((0..batch.num_rows())
            .map(|i| Self {
                metric: text(metric, i).unwrap_or_default(),
                statistic: text(statistic, i).unwrap_or_default(),
                parameter: number(parameter, i),
                branch: text(branch, i).unwrap_or_default(),
                comparison: text(comparison, i),
                comparison_to_branch: text(comparison_to_branch, i),
                ci_width: number(ci_width, i),
                point: number(point, i).unwrap_or_default(),
                lower: number(lower, i),
                upper: number(upper, i),
                segment: text(segment, i).unwrap_or_default(),
            })
            .collect())
    }
}

/// Label every row with `segment`.
pub fn set_segment(rows: &mut [StatisticResult], segment: &str) {
    for row in rows {
        row.segment = segment.to_string();
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::InvalidInput(format!("Expected Utf8 column {name}")))
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| Error::InvalidInput(format!("Expected Float64 column {name}")))
}

/// A named statistic over one metric column.
pub trait Statistic: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Compute result rows for `metric` over `frame`.
    ///
    /// `frame` has a `branch` column and one column per metric. Rows are
    /// labelled with the `all` segment; callers relabel subsets.
    ///
    /// # Errors
    ///
    /// Returns error if the metric column is missing or not numeric.
    fn compute(
        &self,
        frame: &RecordBatch,
        metric: &str,
        experiment: &ExperimentConfiguration,
    ) -> Result<Vec<StatisticResult>>;
}

/// Builds a statistic from its configured parameters.
pub type StatisticFactory = fn(&serde_json::Value) -> Result<Arc<dyn Statistic>>;

/// Statistics available to configuration files, by name.
#[derive(Clone)]
pub struct StatisticRegistry {
    factories: FxHashMap<String, StatisticFactory>,
}

impl Default for StatisticRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("mean", Mean::from_params);
        registry
    }
}

impl StatisticRegistry {
    /// A registry with no statistics.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Add or replace a statistic.
    pub fn register(&mut self, name: impl Into<String>, factory: StatisticFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate a configured statistic.
    ///
    /// # Errors
    ///
    /// `UnknownStatistic` if the name is not registered; otherwise any
    /// parameter error from the factory.
    pub fn build(&self, spec: &StatisticSpec) -> Result<Arc<dyn Statistic>> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| Error::UnknownStatistic(spec.name.clone()))?;
        factory(&spec.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<StatisticResult> {
        vec![
            StatisticResult::point("active_hours", "mean", "a", 1.5).with_interval(0.95, 1.0, 2.0),
            StatisticResult::point("active_hours", "mean", "b", 0.5)
                .with_interval(0.95, 0.1, 0.9)
                .with_comparison("difference", "a"),
            StatisticResult::point("identity", "count", "c", 0.0),
        ]
    }

    #[test]
    fn test_record_batch_preserves_nulls() {
        let batch = StatisticResult::to_record_batch(&rows()).unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema(), StatisticResult::schema());
        assert_eq!(StatisticResult::from_record_batch(&batch).unwrap(), rows());
    }

    #[test]
    fn test_empty_batch() {
        let batch = StatisticResult::to_record_batch(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert!(StatisticResult::from_record_batch(&batch).unwrap().is_empty());
    }

    #[test]
    fn test_from_batch_missing_column() {
        let batch = RecordBatch::new_empty(Arc::new(Schema::empty()));
        assert!(matches!(
            StatisticResult::from_record_batch(&batch),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_set_segment() {
        let mut rows = rows();
        set_segment(&mut rows, "regular_users");
        assert!(rows.iter().all(|r| r.segment == "regular_users"));
    }

    #[test]
    fn test_registry() {
        let registry = StatisticRegistry::default();
        assert!(registry.contains("mean"));
        assert_eq!(registry.names(), vec!["mean"]);

        let spec = StatisticSpec {
            name: "bootstrap_mean".to_string(),
            params: serde_json::Value::Null,
        };
        let err = registry.build(&spec).err().unwrap();
        assert_eq!(err.to_string(), "Statistic bootstrap_mean does not exist");
        assert!(!StatisticRegistry::empty().contains("mean"));
    }
}
