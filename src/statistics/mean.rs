//! Per-branch mean with a normal-approximation confidence interval

use arrow::array::{Array, Float64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Statistic, StatisticResult};
use crate::config::ExperimentConfiguration;
use crate::{Error, Result};

/// Reference branch used when the experiment names none.
const DEFAULT_REFERENCE_BRANCH: &str = "control";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MeanParams {
    confidence: f64,
}

impl Default for MeanParams {
    fn default() -> Self {
        Self { confidence: 0.95 }
    }
}

/// Mean of a metric per branch.
///
/// Emits one row per branch, plus `difference` and `relative_uplift`
/// rows comparing every other branch to the reference branch. Null metric
/// values are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mean {
    confidence: f64,
}

#[derive(Debug, Clone, Copy)]
struct Moments {
    mean: f64,
    standard_error: f64,
}

impl Mean {
    /// Create with a confidence level in `(0, 1)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a confidence level outside `(0, 1)`.
    pub fn new(confidence: f64) -> Result<Self> {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(Error::InvalidInput(format!(
                "confidence must be between 0 and 1, got {confidence}"
            )));
        }
        Ok(Self { confidence })
    }

    /// Factory for the statistic registry.
    ///
    /// # Errors
    ///
    /// Returns error for unknown or invalid parameters.
    pub fn from_params(params: &serde_json::Value) -> Result<Arc<dyn Statistic>> {
        let params: MeanParams = if params.is_null() {
            MeanParams::default()
        } else {
            serde_json::from_value(params.clone())?
        };
        Ok(Arc::new(Self::new(params.confidence)?))
    }

    /// Confidence level.
    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    fn z(&self) -> f64 {
        normal_quantile(0.5 + self.confidence / 2.0)
    }

    fn interval(&self, point: f64, standard_error: f64) -> (f64, f64) {
        let half_width = self.z() * standard_error;
        (point - half_width, point + half_width)
    }
}

impl Statistic for Mean {
    fn name(&self) -> &str {
        "mean"
    }

    fn compute(
        &self,
        frame: &RecordBatch,
        metric: &str,
        experiment: &ExperimentConfiguration,
    ) -> Result<Vec<StatisticResult>> {
        let moments = branch_moments(frame, metric)?;
        let mut results = Vec::new();

        for (branch, m) in &moments {
            let (lower, upper) = self.interval(m.mean, m.standard_error);
            results.push(
                StatisticResult::point(metric, self.name(), branch, m.mean)
                    .with_interval(self.confidence, lower, upper),
            );
        }

        let reference = experiment
            .reference_branch()
            .unwrap_or(DEFAULT_REFERENCE_BRANCH);
        let Some(base) = moments.get(reference) else {
            return Ok(results);
        };

        for (branch, m) in moments.iter().filter(|(b, _)| b.as_str() != reference) {
            let difference = m.mean - base.mean;
            let se = m.standard_error.hypot(base.standard_error);
            let (lower, upper) = self.interval(difference, se);
            results.push(
                StatisticResult::point(metric, self.name(), branch, difference)
                    .with_interval(self.confidence, lower, upper)
                    .with_comparison("difference", reference),
            );

            if base.mean != 0.0 {
                let uplift = difference / base.mean;
                // Delta method on mean / base_mean
                let se = (m.standard_error / base.mean)
                    .hypot(m.mean * base.standard_error / (base.mean * base.mean));
                let (lower, upper) = self.interval(uplift, se);
                results.push(
                    StatisticResult::point(metric, self.name(), branch, uplift)
                        .with_interval(self.confidence, lower, upper)
                        .with_comparison("relative_uplift", reference),
                );
            }
        }

        Ok(results)
    }
}

/// Branch column as strings.
pub(super) fn branch_column(frame: &RecordBatch) -> Result<StringArray> {
    let column = frame
        .column_by_name("branch")
        .ok_or_else(|| Error::InvalidInput("Metrics table has no branch column".to_string()))?;
    let column = cast(column, &DataType::Utf8)?;
    column
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| Error::InvalidInput("branch column is not a string column".to_string()))
}

fn branch_moments(frame: &RecordBatch, metric: &str) -> Result<BTreeMap<String, Moments>> {
    let branches = branch_column(frame)?;
    let column = frame
        .column_by_name(metric)
        .ok_or_else(|| Error::InvalidInput(format!("Metric {metric} not in metrics table")))?;
    let values = cast(column, &DataType::Float64)?;
    let values = values
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| Error::InvalidInput(format!("Metric {metric} is not numeric")))?;

    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for i in 0..frame.num_rows() {
        if branches.is_null(i) || values.is_null(i) {
            continue;
        }
        groups
            .entry(branches.value(i).to_string())
            .or_default()
            .push(values.value(i));
    }

    Ok(groups
        .into_iter()
        .map(|(branch, xs)| (branch, moments(&xs)))
        .collect())
}

#[allow(clippy::cast_precision_loss)]
fn moments(xs: &[f64]) -> Moments {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let variance = if xs.len() > 1 {
        xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    Moments {
        mean,
        standard_error: (variance / n).sqrt(),
    }
}

/// Inverse standard normal CDF (Acklam's rational approximation).
fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p > 1.0 - P_LOW {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    } else {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    }
}
