//! Graph task execution for [`Analysis`]

use arrow::array::{Array, BooleanArray};
use arrow::compute::filter_record_batch;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use tracing::{debug, info};

use super::{first_input, Analysis};
use crate::cadence::Cadence;
use crate::config::Summary;
use crate::graph::{NodeOutput, Task, TaskExecutor};
use crate::naming::{enrollments_table_name, result_table_name, statistics_table_name, STATISTICS_PREFIX};
use crate::statistics::{counts, set_segment, StatisticResult, ALL_SEGMENT};
use crate::timelimits::TimeLimits;
use crate::warehouse::WriteMode;
use crate::{Error, Result};

impl TaskExecutor for Analysis {
    fn execute(&self, task: &Task, inputs: &[&NodeOutput]) -> Result<NodeOutput> {
        match task {
            Task::CalculateMetrics {
                cadence,
                time_limits,
                dry_run,
            } => self.calculate_metrics(*cadence, time_limits, *dry_run),
            Task::LoadTable => {
                let table = expect_table(first_input(inputs, task)?, task)?;
                let frame = self.warehouse().read_table(table)?;
                self.check_segment_columns(&frame)?;
                Ok(NodeOutput::Frame(frame))
            }
            Task::SubsetSegment { segment } => {
                let frame = expect_frame(first_input(inputs, task)?, task)?;
                Ok(NodeOutput::Frame(subset_segment(frame, segment)?))
            }
            Task::Statistics { summary, segment } => {
                let frame = expect_frame(first_input(inputs, task)?, task)?;
                self.statistics(frame, summary, segment).map(NodeOutput::Results)
            }
            Task::Counts { segment } => {
                let frame = expect_frame(first_input(inputs, task)?, task)?;
                counts(frame, self.config.branches(), segment).map(NodeOutput::Results)
            }
            Task::SaveStatistics { cadence } => self.save_statistics(*cadence, task, inputs),
        }
    }
}

impl Analysis {
    fn calculate_metrics(
        &self,
        cadence: Cadence,
        time_limits: &TimeLimits,
        dry_run: bool,
    ) -> Result<NodeOutput> {
        let slug = self.slug()?;
        let window_index = time_limits.analysis_windows().len();
        let table = result_table_name(slug, cadence, window_index);

        if dry_run {
            info!(experiment = slug, table = %table, "Dry run; not actually calculating metrics");
            return Ok(NodeOutput::Table(table));
        }

        let limits = time_limits.last_window_only();
        let metrics = self.config.metrics_for(cadence);
        let sql = self.env.queries.build_metrics_query(
            &metrics,
            &limits,
            &format!("`{}`", self.warehouse().qualified(&enrollments_table_name(slug))),
        )?;

        info!(experiment = slug, table = %table, metrics = metrics.len(), "Calculating metrics");
        self.warehouse().execute(&sql, Some(&table), WriteMode::Truncate)?;
        self.publish_view(cadence, None)?;
        Ok(NodeOutput::Table(table))
    }

    /// Every configured segment must have a column in the metrics frame
    /// before any subset or statistic is computed.
    fn check_segment_columns(&self, frame: &RecordBatch) -> Result<()> {
        match self
            .config
            .segments()
            .iter()
            .find(|segment| frame.column_by_name(&segment.name).is_none())
        {
            Some(missing) => Err(Error::UnknownSegment {
                segment: missing.name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn statistics(
        &self,
        frame: &RecordBatch,
        summary: &Summary,
        segment: &str,
    ) -> Result<Vec<StatisticResult>> {
        let statistic = self.env.statistics.build(&summary.statistic)?;
        let mut rows = statistic.compute(frame, &summary.metric.name, &self.config)?;
        set_segment(&mut rows, segment);
        debug!(
            experiment = self.config.log_slug(),
            metric = %summary.metric.name,
            statistic = statistic.name(),
            segment,
            rows = rows.len(),
            "Computed statistic"
        );
        Ok(rows)
    }

    fn save_statistics(
        &self,
        cadence: Cadence,
        task: &Task,
        inputs: &[&NodeOutput],
    ) -> Result<NodeOutput> {
        let result_table = expect_table(first_input(inputs, task)?, task)?;
        let rows: Vec<StatisticResult> = inputs[1..]
            .iter()
            .filter_map(|input| input.as_results())
            .flatten()
            .cloned()
            .collect();

        let table = statistics_table_name(result_table);
        info!(
            experiment = self.config.log_slug(),
            table = %table,
            rows = rows.len(),
            "Saving statistics"
        );
        self.warehouse().load_rows(
            &StatisticResult::to_record_batch(&rows)?,
            &table,
            WriteMode::Truncate,
        )?;
        self.publish_view(cadence, Some(STATISTICS_PREFIX))?;
        Ok(NodeOutput::Saved(table))
    }
}

/// Rows of `frame` where the boolean `segment` column is true.
///
/// `all` returns the frame unchanged.
///
/// # Errors
///
/// `UnknownSegment` if the column is missing, `InvalidInput` if it is not
/// boolean.
pub fn subset_segment(frame: &RecordBatch, segment: &str) -> Result<RecordBatch> {
    if segment == ALL_SEGMENT {
        return Ok(frame.clone());
    }
    let column = frame
        .column_by_name(segment)
        .ok_or_else(|| Error::UnknownSegment {
            segment: segment.to_string(),
        })?;
    if column.data_type() != &DataType::Boolean {
        return Err(Error::InvalidInput(format!(
            "Segment column {segment} is {}, expected boolean",
            column.data_type()
        )));
    }
    let mask = column
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| Error::InvalidInput(format!("Segment column {segment} is not boolean")))?;
    Ok(filter_record_batch(frame, mask)?)
}

fn expect_table<'a>(output: &'a NodeOutput, task: &Task) -> Result<&'a str> {
    output
        .as_table()
        .ok_or_else(|| Error::Other(format!("{} expected a table input", task.label())))
}

fn expect_frame<'a>(output: &'a NodeOutput, task: &Task) -> Result<&'a RecordBatch> {
    output
        .as_frame()
        .ok_or_else(|| Error::Other(format!("{} expected a frame input", task.label())))
}
