//! Deterministic warehouse names
//!
//! Every table and view name is a pure function of the experiment slug,
//! cadence, and window index. Writing to the same name twice overwrites,
//! which is what makes reruns idempotent.

use crate::cadence::Cadence;

/// Prefix of statistics tables and views.
pub const STATISTICS_PREFIX: &str = "statistics";

/// Replace every character outside `[A-Za-z0-9]` with `_` and lower-case.
///
/// ```
/// use trueno_analysis::naming::normalize_name;
///
/// assert_eq!(normalize_name("My Exp!"), "my_exp_");
/// assert_eq!(normalize_name("org.mozilla.firefox"), "org_mozilla_firefox");
/// ```
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Per-window result table: `{slug}_{cadence}_{window_index}`.
#[must_use]
pub fn result_table_name(slug: &str, cadence: Cadence, window_index: usize) -> String {
    format!("{}_{}_{window_index}", normalize_name(slug), cadence.value())
}

/// Enrolled-population table: `enrollments_{slug}`.
#[must_use]
pub fn enrollments_table_name(slug: &str) -> String {
    format!("enrollments_{}", normalize_name(slug))
}

/// Statistics table for a result table: `statistics_{result_table}`.
#[must_use]
pub fn statistics_table_name(result_table: &str) -> String {
    format!("{STATISTICS_PREFIX}_{result_table}")
}

/// Rolling view name, optionally prefixed: `[{prefix}_]{slug}_{adjective}`.
#[must_use]
pub fn view_name(slug: &str, cadence: Cadence, prefix: Option<&str>) -> String {
    let view = format!("{}_{}", normalize_name(slug), cadence.adjective());
    match prefix {
        Some(prefix) => format!("{}_{view}", normalize_name(prefix)),
        None => view,
    }
}

/// Wildcard over all per-window tables: `[{prefix}_]{slug}_{cadence}_*`.
#[must_use]
pub fn wildcard_table_expr(slug: &str, cadence: Cadence, prefix: Option<&str>) -> String {
    let wildcard = format!("{}_{}_*", normalize_name(slug), cadence.value());
    match prefix {
        Some(prefix) => format!("{}_{wildcard}", normalize_name(prefix)),
        None => wildcard,
    }
}

/// Statement publishing a rolling view over every window of a cadence.
///
/// A single create-or-replace, so readers never observe a partial view.
#[must_use]
pub fn rolling_view_sql(
    project: &str,
    dataset: &str,
    slug: &str,
    cadence: Cadence,
    prefix: Option<&str>,
) -> String {
    let view = view_name(slug, cadence, prefix);
    let wildcard = wildcard_table_expr(slug, cadence, prefix);
    format!(
        "CREATE OR REPLACE VIEW `{project}.{dataset}.{view}` AS (\n    \
         SELECT\n        *,\n        CAST(_TABLE_SUFFIX AS INTEGER) AS window_index\n    \
         FROM `{project}.{dataset}.{wildcard}`\n)"
    )
}

/// Replace non-alphanumerics in an application id, as used for dataset names.
#[must_use]
pub fn app_id_to_dataset(app_id: &str) -> String {
    app_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_table_name() {
        assert_eq!(result_table_name("My Exp!", Cadence::Week, 1), "my_exp__week_1");
        assert_eq!(
            result_table_name("My Exp!", Cadence::Week, 1),
            result_table_name("My Exp!", Cadence::Week, 1)
        );
    }

    #[test]
    fn test_enrollment_and_statistics_names() {
        assert_eq!(enrollments_table_name("test-experiment"), "enrollments_test_experiment");
        assert_eq!(
            statistics_table_name("test_experiment_week_1"),
            "statistics_test_experiment_week_1"
        );
    }

    #[test]
    fn test_view_names() {
        assert_eq!(view_name("test-experiment", Cadence::Week, None), "test_experiment_weekly");
        assert_eq!(
            view_name("test-experiment", Cadence::Days28, Some("statistics")),
            "statistics_test_experiment_28_day"
        );
        assert_eq!(
            wildcard_table_expr("test-experiment", Cadence::Overall, Some("statistics")),
            "statistics_test_experiment_overall_*"
        );
    }

    #[test]
    fn test_rolling_view_sql() {
        let sql = rolling_view_sql("proj", "ds", "test-experiment", Cadence::Week, None);
        assert!(sql.starts_with("CREATE OR REPLACE VIEW `proj.ds.test_experiment_weekly` AS ("));
        assert!(sql.contains("CAST(_TABLE_SUFFIX AS INTEGER) AS window_index"));
        assert!(sql.contains("FROM `proj.ds.test_experiment_week_*`"));
    }

    #[test]
    fn test_app_id_keeps_case() {
        assert_eq!(app_id_to_dataset("org.mozilla.Fenix"), "org_mozilla_Fenix");
    }
}
