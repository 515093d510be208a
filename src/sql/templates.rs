//! Template-based query builder

use super::{EnrollmentsRequest, QueryBuilder, METRICS_QUERY_PREFIX};
use crate::config::{DataSource, EnrollmentsQueryType, Metric, Segment};
use crate::timelimits::TimeLimits;
use crate::{Error, Result};

/// Days of history before enrollment used to evaluate segments.
const SEGMENT_LOOKBACK_DAYS: u32 = 7;

/// Builds queries by filling SQL templates.
///
/// # Example
///
/// ```
/// use chrono::NaiveDate;
/// use trueno_analysis::cadence::Cadence;
/// use trueno_analysis::sql::{QueryBuilder, TemplateQueryBuilder};
/// use trueno_analysis::timelimits::TimeLimits;
///
/// # fn example() -> trueno_analysis::Result<()> {
/// let limits = TimeLimits::for_ts(
///     NaiveDate::from_ymd_opt(2020, 3, 30).unwrap(),
///     NaiveDate::from_ymd_opt(2020, 4, 12).unwrap(),
///     Cadence::Week,
///     8,
/// )?;
/// let sql = TemplateQueryBuilder::new().build_metrics_query(&[], &limits, "enrollments_spam");
/// assert!(sql.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TemplateQueryBuilder {
    source_project: String,
}

impl TemplateQueryBuilder {
    /// Builder reading enrollment events from the shared production project.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source_project("moz-fx-data-shared-prod")
    }

    /// Builder reading enrollment events from `project`.
    #[must_use]
    pub fn with_source_project(project: impl Into<String>) -> Self {
        Self {
            source_project: project.into(),
        }
    }

    fn normandy_enrollments(&self, slug: &str, first: &str, last: &str) -> String {
        format!(
            "SELECT
            e.client_id,
            mozfun.map.get_key(e.event_map_values, 'branch') AS branch,
            MIN(e.submission_date) AS enrollment_date,
            COUNT(e.submission_date) AS num_enrollment_events
        FROM `{project}.telemetry.events` e
        WHERE
            e.event_category = 'normandy'
            AND e.event_method = 'enroll'
            AND e.submission_date BETWEEN '{first}' AND '{last}'
            AND e.event_string_value = '{slug}'
        GROUP BY e.client_id, branch",
            project = self.source_project,
        )
    }

    fn glean_enrollments(&self, slug: &str, dataset: &str, first: &str, last: &str) -> String {
        format!(
            "SELECT
            events.client_info.client_id AS client_id,
            mozfun.map.get_key(e.extra, 'branch') AS branch,
            DATE(MIN(events.submission_timestamp)) AS enrollment_date,
            COUNT(events.submission_timestamp) AS num_enrollment_events
        FROM `{project}.{dataset}.events` events, UNNEST(events.events) AS e
        WHERE
            e.category = 'nimbus_events'
            AND e.name = 'enrollment'
            AND DATE(events.submission_timestamp) BETWEEN '{first}' AND '{last}'
            AND mozfun.map.get_key(e.extra, 'experiment') = '{slug}'
        GROUP BY client_id, branch",
            project = self.source_project,
        )
    }

    fn fenix_fallback_enrollments(
        &self,
        slug: &str,
        dataset: &str,
        first: &str,
        last: &str,
    ) -> String {
        let events = self.glean_enrollments(slug, dataset, first, last);
        format!(
            "SELECT
            u.client_id,
            u.branch,
            MIN(u.enrollment_date) AS enrollment_date,
            SUM(u.num_enrollment_events) AS num_enrollment_events
        FROM (
            {events}
            UNION ALL
            SELECT
                b.client_info.client_id AS client_id,
                x.value.branch AS branch,
                DATE(MIN(b.submission_timestamp)) AS enrollment_date,
                0 AS num_enrollment_events
            FROM `{project}.{dataset}.baseline` b, UNNEST(b.ping_info.experiments) AS x
            WHERE
                DATE(b.submission_timestamp) BETWEEN '{first}' AND '{last}'
                AND x.key = '{slug}'
            GROUP BY client_id, branch
        ) AS u
        GROUP BY u.client_id, u.branch",
            project = self.source_project,
        )
    }

    fn segment_cte(segment: &Segment) -> String {
        let DataSource {
            from_expression,
            client_id_column,
            submission_date_column,
            ..
        } = &segment.data_source;
        format!(
            "segment_{name} AS (
        SELECT
            e.client_id,
            e.branch,
            {select} AS {name}
        FROM raw_enrollments e
        LEFT JOIN {from_expression} ds
            ON {client_id} = e.client_id
            AND {submission_date} BETWEEN DATE_SUB(e.enrollment_date, INTERVAL {lookback} DAY) AND e.enrollment_date
        GROUP BY e.client_id, e.branch
    )",
            name = segment.name,
            select = segment.select_expression,
            client_id = qualify(client_id_column),
            submission_date = qualify(submission_date_column),
            lookback = SEGMENT_LOOKBACK_DAYS,
        )
    }
}

/// Qualify a plain column path with the `ds` alias; expressions pass through.
fn qualify(column: &str) -> String {
    if column
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        format!("ds.{column}")
    } else {
        column.to_string()
    }
}

impl QueryBuilder for TemplateQueryBuilder {
    fn build_enrollments_query(&self, request: &EnrollmentsRequest<'_>) -> Result<String> {
        let limits = request.time_limits;
        let first = limits.first_enrollment_date().to_string();
        let last = limits.last_enrollment_date().to_string();
        let slug = request.experiment_slug;

        let raw = match request.custom_query {
            Some(custom) => custom.trim().to_string(),
            None => match request.query_type {
                EnrollmentsQueryType::Normandy => self.normandy_enrollments(slug, &first, &last),
                EnrollmentsQueryType::GleanEvent => {
                    self.glean_enrollments(slug, request.app_dataset, &first, &last)
                }
                EnrollmentsQueryType::FenixFallback => {
                    self.fenix_fallback_enrollments(slug, request.app_dataset, &first, &last)
                }
            },
        };

        let mut ctes = vec![format!("raw_enrollments AS (\n        {raw}\n    )")];
        ctes.extend(request.segments.iter().map(Self::segment_cte));

        let mut columns = vec!["raw_enrollments.*".to_string()];
        let mut joins = Vec::new();
        for segment in request.segments {
            columns.push(format!("segment_{name}.{name}", name = segment.name));
            joins.push(format!(
                "LEFT JOIN segment_{} USING (client_id, branch)",
                segment.name
            ));
        }

        let mut sql = format!(
            "WITH {}\nSELECT\n    {}\nFROM raw_enrollments",
            ctes.join(",\n"),
            columns.join(",\n    ")
        );
        for join in joins {
            sql.push('\n');
            sql.push_str(&join);
        }
        Ok(sql)
    }

    fn build_metrics_query(
        &self,
        metrics: &[&Metric],
        time_limits: &TimeLimits,
        enrollments_table: &str,
    ) -> Result<String> {
        if metrics.is_empty() {
            return Err(Error::InvalidInput(
                "At least one metric is required".to_string(),
            ));
        }

        let windows = time_limits
            .analysis_windows()
            .iter()
            .map(|w| {
                format!(
                    "SELECT {} AS analysis_window_start, {} AS analysis_window_end",
                    w.start(),
                    w.end()
                )
            })
            .collect::<Vec<_>>()
            .join("\n    UNION ALL\n    ");

        // Group metrics by data source, keeping first-seen order
        let mut sources: Vec<(&DataSource, Vec<&Metric>)> = Vec::new();
        for &metric in metrics {
            match sources.iter_mut().find(|(ds, _)| ds.name == metric.data_source.name) {
                Some((_, group)) => group.push(metric),
                None => sources.push((&metric.data_source, vec![metric])),
            }
        }

        let mut ctes = vec![
            format!("{METRICS_QUERY_PREFIX}\n    {windows}\n)"),
            format!(
                "raw_enrollments AS (
    SELECT e.*, aw.*
    FROM {enrollments_table} e
    CROSS JOIN analysis_windows aw
)"
            ),
            format!(
                "enrollments AS (
    SELECT e.*
    FROM raw_enrollments e
    WHERE e.enrollment_date BETWEEN '{}' AND '{}'
)",
                time_limits.first_enrollment_date(),
                time_limits.last_enrollment_date()
            ),
        ];

        let mut columns = vec!["enrollments.*".to_string()];
        let mut joins = Vec::new();
        for (i, (source, group)) in sources.iter().enumerate() {
            let selects = group
                .iter()
                .map(|m| format!("{} AS {}", m.select_expression, m.name))
                .collect::<Vec<_>>()
                .join(",\n        ");
            let submission_date = qualify(&source.submission_date_column);
            ctes.push(format!(
                "ds_{i} AS (
    SELECT
        e.client_id,
        e.branch,
        e.analysis_window_start,
        e.analysis_window_end,
        {selects}
    FROM enrollments e
    LEFT JOIN {from} ds
        ON {client_id} = e.client_id
        AND {submission_date} BETWEEN '{first}' AND '{last}'
        AND {submission_date} BETWEEN
            DATE_ADD(e.enrollment_date, INTERVAL e.analysis_window_start DAY)
            AND DATE_ADD(e.enrollment_date, INTERVAL e.analysis_window_end DAY)
    GROUP BY e.client_id, e.branch, e.analysis_window_start, e.analysis_window_end
)",
                from = source.from_expression,
                client_id = qualify(&source.client_id_column),
                first = time_limits.first_date_data_required(),
                last = time_limits.last_date_data_required(),
            ));
            columns.extend(group.iter().map(|m| format!("ds_{i}.{}", m.name)));
            joins.push(format!(
                "LEFT JOIN ds_{i} USING (client_id, branch, analysis_window_start, analysis_window_end)"
            ));
        }

        let mut sql = format!(
            "{}\nSELECT\n    {}\nFROM enrollments",
            ctes.join(",\n"),
            columns.join(",\n    ")
        );
        for join in joins {
            sql.push('\n');
            sql.push_str(&join);
        }
        Ok(sql)
    }
}
