//! Client counts per branch

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;

use super::mean::branch_column;
use super::{set_segment, StatisticResult};
use crate::experiment::Branch;
use crate::Result;

/// Metric name of count rows.
pub const COUNT_METRIC: &str = "identity";

/// Statistic name of count rows.
pub const COUNT_STATISTIC: &str = "count";

/// Number of clients per branch in `frame`, labelled with `segment`.
///
/// Every configured branch gets a row; branches with no clients in the
/// frame get an explicit zero. Branches present in the data but not
/// configured are still reported.
///
/// # Errors
///
/// Returns error if `frame` has no usable `branch` column.
#[allow(clippy::cast_precision_loss)]
pub fn counts(frame: &RecordBatch, branches: &[Branch], segment: &str) -> Result<Vec<StatisticResult>> {
    let column = branch_column(frame)?;
    let mut tally: FxHashMap<&str, usize> = FxHashMap::default();
    for i in 0..column.len() {
        if column.is_valid(i) {
            *tally.entry(column.value(i)).or_default() += 1;
        }
    }

    let mut observed: Vec<(&str, usize)> = tally.into_iter().collect();
    observed.sort_unstable();

    let mut rows: Vec<StatisticResult> = observed
        .iter()
        .map(|(branch, n)| StatisticResult::point(COUNT_METRIC, COUNT_STATISTIC, branch, *n as f64))
        .collect();
    for branch in branches {
        if !observed.iter().any(|(b, _)| *b == branch.slug) {
            rows.push(StatisticResult::point(COUNT_METRIC, COUNT_STATISTIC, &branch.slug, 0.0));
        }
    }

    set_segment(&mut rows, segment);
    Ok(rows)
}
