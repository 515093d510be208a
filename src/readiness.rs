//! Readiness: has a new analysis window closed today?
//!
//! A pure function of (cadence, schedule, date). Nothing is remembered
//! between calls; the answer for a date is re-derived identically every
//! time it is asked.
//!
//! ## Periodic cadences
//!
//! | today          | yesterday      | result                       |
//! |----------------|----------------|------------------------------|
//! | insufficient   | (not computed) | not ready                    |
//! | N windows      | insufficient   | ready (first window, N = 1)  |
//! | N windows      | N windows      | not ready (nothing new)      |
//! | N windows      | M < N windows  | ready                        |
//!
//! ## Overall
//!
//! Fires once: on the end date of a `Complete` experiment, with one window
//! spanning everything after enrollment.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::cadence::Cadence;
use crate::config::ExperimentConfiguration;
use crate::experiment::ExperimentStatus;
use crate::timelimits::TimeLimits;
use crate::{Error, Result};

/// The parts of an experiment readiness depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSchedule {
    /// Slug used in error messages
    pub slug: String,
    /// First enrollment date
    pub start_date: Option<NaiveDate>,
    /// End date, once known
    pub end_date: Option<NaiveDate>,
    /// Proposed enrollment length in days
    pub proposed_enrollment: u32,
    /// Lifecycle status
    pub status: Option<ExperimentStatus>,
}

impl ExperimentSchedule {
    /// Days of enrollment, counting both ends.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the proposed enrollment is too long to count.
    pub fn num_dates_enrollment(&self) -> Result<u32> {
        self.proposed_enrollment.checked_add(1).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Proposed enrollment of {} days is out of range for {}",
                self.proposed_enrollment, self.slug
            ))
        })
    }
}

impl From<&ExperimentConfiguration> for ExperimentSchedule {
    fn from(config: &ExperimentConfiguration) -> Self {
        Self {
            slug: config.log_slug().to_string(),
            start_date: config.start_date(),
            end_date: config.end_date(),
            proposed_enrollment: config.proposed_enrollment().unwrap_or_default(),
            status: config.status(),
        }
    }
}

/// Time limits if `cadence` has a newly closed window on `current_date`.
///
/// `Ok(None)` means not ready.
///
/// # Errors
///
/// - `EnrollmentLongerThanAnalysis` if the overall window would have no
///   days after enrollment
/// - any time limit error other than `InsufficientData`
///
/// # Example
///
/// ```
/// use chrono::NaiveDate;
/// use trueno_analysis::cadence::Cadence;
/// use trueno_analysis::readiness::{readiness, ExperimentSchedule};
///
/// let schedule = ExperimentSchedule {
///     slug: "spam".to_string(),
///     start_date: NaiveDate::from_ymd_opt(2020, 3, 30),
///     end_date: None,
///     proposed_enrollment: 7,
///     status: None,
/// };
/// let date = |d| NaiveDate::from_ymd_opt(2020, 4, d).unwrap();
///
/// assert!(readiness(Cadence::Week, &schedule, date(11))?.is_none());
/// let limits = readiness(Cadence::Week, &schedule, date(12))?.unwrap();
/// assert_eq!(limits.analysis_windows().len(), 1);
/// assert!(readiness(Cadence::Week, &schedule, date(13))?.is_none());
/// # Ok::<(), trueno_analysis::Error>(())
/// ```
pub fn readiness(
    cadence: Cadence,
    schedule: &ExperimentSchedule,
    current_date: NaiveDate,
) -> Result<Option<TimeLimits>> {
    let Some(start_date) = schedule.start_date else {
        return Ok(None);
    };

    if cadence.is_periodic() {
        periodic(cadence, schedule, start_date, current_date)
    } else {
        overall(schedule, start_date, current_date)
    }
}

fn not_ready_if_insufficient(result: Result<TimeLimits>) -> Result<Option<TimeLimits>> {
    match result {
        Ok(limits) => Ok(Some(limits)),
        Err(Error::InsufficientData(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn periodic(
    cadence: Cadence,
    schedule: &ExperimentSchedule,
    start_date: NaiveDate,
    current_date: NaiveDate,
) -> Result<Option<TimeLimits>> {
    let num_dates = schedule.num_dates_enrollment()?;
    let limits_on = |date| TimeLimits::for_ts(start_date, date, cadence, num_dates);

    let Some(today) = not_ready_if_insufficient(limits_on(current_date))? else {
        return Ok(None);
    };
    let Some(yesterday) = not_ready_if_insufficient(limits_on(current_date - Duration::days(1)))?
    else {
        // First window closed today
        return Ok(Some(today));
    };

    if today.analysis_windows().len() == yesterday.analysis_windows().len() {
        return Ok(None);
    }
    Ok(Some(today))
}

fn overall(
    schedule: &ExperimentSchedule,
    start_date: NaiveDate,
    current_date: NaiveDate,
) -> Result<Option<TimeLimits>> {
    let Some(end_date) = schedule.end_date else {
        return Ok(None);
    };
    if end_date != current_date || schedule.status != Some(ExperimentStatus::Complete) {
        return Ok(None);
    }

    let num_dates = schedule.num_dates_enrollment()?;
    let analysis_length_dates = analysis_length_dates(start_date, end_date, num_dates);
    if analysis_length_dates <= 0 {
        return Err(Error::EnrollmentLongerThanAnalysis {
            slug: schedule.slug.clone(),
        });
    }

    not_ready_if_insufficient(TimeLimits::for_single_analysis_window(
        start_date,
        current_date - Duration::days(1),
        0,
        analysis_length_dates,
        num_dates,
    ))
}

/// Days between the end of enrollment and `end_date`.
#[must_use]
pub fn analysis_length_dates(start_date: NaiveDate, end_date: NaiveDate, num_dates_enrollment: u32) -> i64 {
    (end_date - start_date).num_days() - i64::from(num_dates_enrollment) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn schedule() -> ExperimentSchedule {
        ExperimentSchedule {
            slug: "test-experiment".to_string(),
            start_date: Some(date(2020, 3, 30)),
            end_date: Some(date(2020, 6, 1)),
            proposed_enrollment: 7,
            status: Some(ExperimentStatus::Live),
        }
    }

    #[test]
    fn test_no_start_date_is_never_ready() {
        let mut schedule = schedule();
        schedule.start_date = None;
        for cadence in Cadence::ALL {
            assert!(readiness(cadence, &schedule, date(2020, 4, 12)).unwrap().is_none());
        }
    }

    #[test]
    fn test_weekly_first_window() {
        let limits = readiness(Cadence::Week, &schedule(), date(2020, 4, 12))
            .unwrap()
            .unwrap();
        let windows = limits.analysis_windows();
        assert_eq!(windows.len(), 1);
        assert_eq!((windows[0].start(), windows[0].end()), (0, 6));
        assert_eq!(limits.last_enrollment_date(), date(2020, 4, 6));
    }

    #[test]
    fn test_weekly_second_window() {
        let schedule = schedule();
        assert!(readiness(Cadence::Week, &schedule, date(2020, 4, 18)).unwrap().is_none());
        let limits = readiness(Cadence::Week, &schedule, date(2020, 4, 19))
            .unwrap()
            .unwrap();
        assert_eq!(limits.analysis_windows().len(), 2);
    }

    #[test]
    fn test_daily_ready_every_day_after_enrollment() {
        let schedule = schedule();
        assert!(readiness(Cadence::Day, &schedule, date(2020, 4, 5)).unwrap().is_none());
        for day in 6..=20 {
            assert!(readiness(Cadence::Day, &schedule, date(2020, 4, day)).unwrap().is_some());
        }
    }

    #[test]
    fn test_overall_requires_complete_status() {
        let mut schedule = schedule();
        assert!(readiness(Cadence::Overall, &schedule, date(2020, 6, 1)).unwrap().is_none());
        schedule.status = Some(ExperimentStatus::Complete);
        let limits = readiness(Cadence::Overall, &schedule, date(2020, 6, 1))
            .unwrap()
            .unwrap();
        let window = limits.analysis_windows()[0];
        assert_eq!(window.start(), 0);
        assert_eq!(window.length(), 56);
        assert_eq!(limits.last_date_data_required(), date(2020, 5, 31));
        assert!(readiness(Cadence::Overall, &schedule, date(2020, 6, 2)).unwrap().is_none());
    }

    #[test]
    fn test_overall_enrollment_longer_than_analysis() {
        let schedule = ExperimentSchedule {
            end_date: Some(date(2020, 4, 2)),
            status: Some(ExperimentStatus::Complete),
            ..schedule()
        };
        let err = readiness(Cadence::Overall, &schedule, date(2020, 4, 2)).unwrap_err();
        assert!(matches!(err, Error::EnrollmentLongerThanAnalysis { slug } if slug == "test-experiment"));
    }

    #[test]
    fn test_absurd_enrollment_is_an_error() {
        let schedule = ExperimentSchedule {
            proposed_enrollment: u32::MAX,
            ..schedule()
        };
        for cadence in [Cadence::Day, Cadence::Week] {
            assert!(matches!(
                readiness(cadence, &schedule, date(2020, 4, 12)),
                Err(Error::InvalidInput(_))
            ));
        }

        let schedule = ExperimentSchedule {
            proposed_enrollment: u32::MAX - 1,
            ..self::schedule()
        };
        assert!(matches!(
            readiness(Cadence::Week, &schedule, date(2020, 4, 12)),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_analysis_length_dates() {
        assert_eq!(analysis_length_dates(date(2020, 3, 30), date(2020, 6, 1), 8), 56);
        assert_eq!(analysis_length_dates(date(2020, 3, 30), date(2020, 4, 2), 8), -4);
    }
}
