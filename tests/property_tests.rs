//! Property-based tests for readiness and naming
//!
//! - Test scheduling invariants over arbitrary start dates and enrollment lengths
//! - Test that answers depend on inputs only (no hidden state)
//! - Run with ProptestConfig::with_cases(100)

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use trueno_analysis::cadence::Cadence;
use trueno_analysis::experiment::ExperimentStatus;
use trueno_analysis::naming::{normalize_name, result_table_name};
use trueno_analysis::readiness::{readiness, ExperimentSchedule};
use trueno_analysis::timelimits::TimeLimits;

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Generate a start date within a few years
fn arb_start_date() -> impl Strategy<Value = NaiveDate> {
    (0i64..1500).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2019, 1, 1).unwrap() + Duration::days(offset)
    })
}

/// Generate a schedule without an end date
fn arb_schedule() -> impl Strategy<Value = ExperimentSchedule> {
    (arb_start_date(), 0u32..30).prop_map(|(start_date, proposed_enrollment)| {
        ExperimentSchedule {
            slug: "prop-experiment".to_string(),
            start_date: Some(start_date),
            end_date: None,
            proposed_enrollment,
            status: Some(ExperimentStatus::Live),
        }
    })
}

/// Generate a periodic cadence
fn arb_periodic_cadence() -> impl Strategy<Value = Cadence> {
    prop_oneof![Just(Cadence::Day), Just(Cadence::Week), Just(Cadence::Days28)]
}

/// Days of data after enrollment closed as of `date` (may be negative)
fn days_of_data(schedule: &ExperimentSchedule, date: NaiveDate) -> i64 {
    let last_enrollment_date =
        schedule.start_date.unwrap() + Duration::days(i64::from(schedule.proposed_enrollment));
    (date - last_enrollment_date).num_days() + 1
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // ========================================================================
    // Periodic Readiness Properties
    // ========================================================================

    /// Property: a periodic cadence is ready exactly when a window boundary falls on the date
    #[test]
    fn prop_ready_exactly_on_window_boundaries(
        schedule in arb_schedule(),
        cadence in arb_periodic_cadence(),
        offset in -10i64..120,
    ) {
        let date = schedule.start_date.unwrap() + Duration::days(offset);
        let window_length = cadence.window_length().unwrap();
        let available = days_of_data(&schedule, date);
        let expected = available >= window_length && available % window_length == 0;

        let result = readiness(cadence, &schedule, date).unwrap();
        prop_assert_eq!(result.is_some(), expected);
    }

    /// Property: the windows of a ready date are contiguous and cover all closed periods
    #[test]
    fn prop_ready_windows_are_contiguous(
        schedule in arb_schedule(),
        cadence in arb_periodic_cadence(),
        offset in 0i64..120,
    ) {
        let date = schedule.start_date.unwrap() + Duration::days(offset);
        if let Some(limits) = readiness(cadence, &schedule, date).unwrap() {
            let window_length = cadence.window_length().unwrap();
            let windows = limits.analysis_windows();
            prop_assert_eq!(windows.len() as i64, days_of_data(&schedule, date) / window_length);
            for (i, window) in windows.iter().enumerate() {
                prop_assert_eq!(window.start(), i as i64 * window_length);
                prop_assert_eq!(window.length(), window_length);
            }
            prop_assert_eq!(limits.last_date_data_required(), date);
        }
    }

    /// Property: asking twice gives the same answer
    #[test]
    fn prop_readiness_is_repeatable(
        schedule in arb_schedule(),
        cadence in arb_periodic_cadence(),
        offset in -10i64..120,
    ) {
        let date = schedule.start_date.unwrap() + Duration::days(offset);
        let first = readiness(cadence, &schedule, date).unwrap();
        let second = readiness(cadence, &schedule, date).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Property: consecutive ready dates never repeat a window count
    #[test]
    fn prop_each_window_fires_once(
        schedule in arb_schedule(),
        cadence in arb_periodic_cadence(),
    ) {
        let start = schedule.start_date.unwrap();
        let mut last_count = 0;
        for offset in 0..100 {
            let date = start + Duration::days(offset);
            if let Some(limits) = readiness(cadence, &schedule, date).unwrap() {
                let count = limits.analysis_windows().len();
                prop_assert_eq!(count, last_count + 1);
                last_count = count;
            }
        }
    }

    // ========================================================================
    // Overall Readiness Properties
    // ========================================================================

    /// Property: overall fires at most once, on the end date
    #[test]
    fn prop_overall_fires_at_most_once(
        schedule in arb_schedule(),
        length in 0i64..90,
    ) {
        let start = schedule.start_date.unwrap();
        let end_date = start + Duration::days(length);
        let schedule = ExperimentSchedule {
            end_date: Some(end_date),
            status: Some(ExperimentStatus::Complete),
            ..schedule
        };

        let mut fired = Vec::new();
        for offset in 0..=100 {
            let date = start + Duration::days(offset);
            if let Ok(Some(_)) = readiness(Cadence::Overall, &schedule, date) {
                fired.push(date);
            }
        }
        prop_assert!(fired.len() <= 1);
        if let Some(date) = fired.first() {
            prop_assert_eq!(*date, end_date);
        }
    }

    // ========================================================================
    // Time Limit Properties
    // ========================================================================

    /// Property: narrowing to the last window keeps only the newest window
    #[test]
    fn prop_last_window_only_keeps_newest(
        start in arb_start_date(),
        offset in 7i64..200,
        enrollment in 1u32..15,
    ) {
        let today = start + Duration::days(offset + i64::from(enrollment));
        let limits = TimeLimits::for_ts(start, today, Cadence::Week, enrollment).unwrap();
        let narrowed = limits.last_window_only();

        prop_assert_eq!(narrowed.analysis_windows().len(), 1);
        prop_assert_eq!(narrowed.last_window(), limits.last_window());
        prop_assert_eq!(narrowed.last_date_data_required(), limits.last_date_data_required());
        prop_assert_eq!(narrowed.last_enrollment_date(), limits.last_enrollment_date());
    }

    // ========================================================================
    // Naming Properties
    // ========================================================================

    /// Property: normalized names only contain lower-case alphanumerics and underscores
    #[test]
    fn prop_normalized_names_are_table_safe(name in "\\PC{0,40}") {
        let normalized = normalize_name(&name);
        prop_assert_eq!(normalized.chars().count(), name.chars().count());
        prop_assert!(normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    /// Property: result table names are deterministic and end in the window index
    #[test]
    fn prop_result_table_name_deterministic(
        slug in "[a-zA-Z0-9-]{1,30}",
        index in 1usize..200,
    ) {
        let name = result_table_name(&slug, Cadence::Week, index);
        prop_assert_eq!(&name, &result_table_name(&slug, Cadence::Week, index));
        let suffix = format!("_week_{index}");
        prop_assert!(name.ends_with(&suffix));
    }
}
