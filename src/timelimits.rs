//! Time limits of an analysis
//!
//! `TimeLimits` describes which calendar dates an analysis needs: the
//! enrollment period and the analysis windows that follow it. Window
//! offsets are in days relative to each client's enrollment date, and
//! windows are inclusive on both ends.
//!
//! ```text
//! first_enrollment_date      last_enrollment_date
//!   |<----- enrollment ----->|
//!                             |<- window 1 ->|<- window 2 ->| ...
//! ```

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::cadence::Cadence;
use crate::{Error, Result};

/// One closed analysis window: `[start, end]` days after enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisWindow {
    start: i64,
    end: i64,
}

impl AnalysisWindow {
    /// Create a window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `end < start` or `start < 0`.
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start < 0 || end < start {
            return Err(Error::InvalidInput(format!(
                "Invalid analysis window [{start}, {end}]"
            )));
        }
        Ok(Self { start, end })
    }

    /// First day offset (inclusive).
    #[must_use]
    pub const fn start(&self) -> i64 {
        self.start
    }

    /// Last day offset (inclusive).
    #[must_use]
    pub const fn end(&self) -> i64 {
        self.end
    }

    /// Number of days covered.
    #[must_use]
    pub const fn length(&self) -> i64 {
        self.end - self.start + 1
    }
}

/// Dates an analysis depends on. Derived fresh on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimits {
    first_enrollment_date: NaiveDate,
    last_enrollment_date: NaiveDate,
    first_date_data_required: NaiveDate,
    last_date_data_required: NaiveDate,
    analysis_windows: Vec<AnalysisWindow>,
}

impl TimeLimits {
    /// Time series limits: as many whole cadence windows as fit into the
    /// data available after enrollment closed.
    ///
    /// # Errors
    ///
    /// - `InsufficientData` if not even one window has closed yet
    /// - `InvalidInput` for the terminal cadence or zero enrollment days
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::NaiveDate;
    /// use trueno_analysis::cadence::Cadence;
    /// use trueno_analysis::timelimits::TimeLimits;
    ///
    /// let start = NaiveDate::from_ymd_opt(2020, 3, 30).unwrap();
    /// let today = NaiveDate::from_ymd_opt(2020, 4, 12).unwrap();
    /// let limits = TimeLimits::for_ts(start, today, Cadence::Week, 8)?;
    /// assert_eq!(limits.analysis_windows().len(), 1);
    /// # Ok::<(), trueno_analysis::Error>(())
    /// ```
    pub fn for_ts(
        first_enrollment_date: NaiveDate,
        last_date_full_data: NaiveDate,
        cadence: Cadence,
        num_dates_enrollment: u32,
    ) -> Result<Self> {
        let window_length = cadence.window_length().ok_or_else(|| {
            Error::InvalidInput(format!("Unsupported time series period {cadence}"))
        })?;
        if num_dates_enrollment == 0 {
            return Err(Error::InvalidInput(
                "Number of enrollment dates must be a positive number".to_string(),
            ));
        }

        let last_enrollment_date =
            days_after(first_enrollment_date, i64::from(num_dates_enrollment) - 1)?;
        let max_dates_of_data = (last_date_full_data - last_enrollment_date).num_days() + 1;
        let num_periods = max_dates_of_data.div_euclid(window_length);
        if num_periods <= 0 {
            return Err(Error::InsufficientData(format!(
                "no {} window closed by {last_date_full_data}",
                cadence.adjective()
            )));
        }

        let analysis_windows = (0..num_periods)
            .map(|i| AnalysisWindow::new(i * window_length, (i + 1) * window_length - 1))
            .collect::<Result<Vec<_>>>()?;
        let last_end = analysis_windows.last().map_or(0, AnalysisWindow::end);

        Ok(Self {
            first_enrollment_date,
            last_enrollment_date,
            first_date_data_required: first_enrollment_date,
            last_date_data_required: days_after(last_enrollment_date, last_end)?,
            analysis_windows,
        })
    }

    /// Limits with a single window of `analysis_length_dates` days starting
    /// `analysis_start_days` after enrollment.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the window would be empty
    /// - `InsufficientData` if `last_date_full_data` does not yet cover it
    pub fn for_single_analysis_window(
        first_enrollment_date: NaiveDate,
        last_date_full_data: NaiveDate,
        analysis_start_days: i64,
        analysis_length_dates: i64,
        num_dates_enrollment: u32,
    ) -> Result<Self> {
        let window_end = analysis_start_days
            .checked_add(analysis_length_dates - 1)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Analysis window of {analysis_length_dates} days is out of range"
                ))
            })?;
        let window = AnalysisWindow::new(analysis_start_days, window_end)?;
        if num_dates_enrollment == 0 {
            return Err(Error::InvalidInput(
                "Number of enrollment dates must be a positive number".to_string(),
            ));
        }

        let last_enrollment_date =
            days_after(first_enrollment_date, i64::from(num_dates_enrollment) - 1)?;
        let last_date_data_required = days_after(last_enrollment_date, window.end())?;
        if last_date_data_required > last_date_full_data {
            return Err(Error::InsufficientData(format!(
                "{num_dates_enrollment} enrollment dates and data through day {} \
                 need data until {last_date_data_required}",
                window.end()
            )));
        }

        Ok(Self {
            first_enrollment_date,
            last_enrollment_date,
            first_date_data_required: days_after(first_enrollment_date, window.start())?,
            last_date_data_required,
            analysis_windows: vec![window],
        })
    }

    /// Same limits narrowed to the newest window only.
    ///
    /// Earlier windows are already materialized and are not recomputed.
    #[must_use]
    pub fn last_window_only(&self) -> Self {
        let Some(last) = self.analysis_windows.last().copied() else {
            return self.clone();
        };
        Self {
            first_date_data_required: self.first_enrollment_date + Duration::days(last.start()),
            analysis_windows: vec![last],
            ..self.clone()
        }
    }

    /// First date of enrollment.
    #[must_use]
    pub const fn first_enrollment_date(&self) -> NaiveDate {
        self.first_enrollment_date
    }

    /// Last date of enrollment (inclusive).
    #[must_use]
    pub const fn last_enrollment_date(&self) -> NaiveDate {
        self.last_enrollment_date
    }

    /// Number of enrollment dates.
    #[must_use]
    pub fn num_dates_enrollment(&self) -> i64 {
        (self.last_enrollment_date - self.first_enrollment_date).num_days() + 1
    }

    /// Earliest date whose data is read.
    #[must_use]
    pub const fn first_date_data_required(&self) -> NaiveDate {
        self.first_date_data_required
    }

    /// Last date for which complete data must exist.
    #[must_use]
    pub const fn last_date_data_required(&self) -> NaiveDate {
        self.last_date_data_required
    }

    /// Analysis windows, oldest first.
    #[must_use]
    pub fn analysis_windows(&self) -> &[AnalysisWindow] {
        &self.analysis_windows
    }

    /// Newest window.
    #[must_use]
    pub fn last_window(&self) -> Option<&AnalysisWindow> {
        self.analysis_windows.last()
    }
}

/// `date` moved `days` days forward.
///
/// # Errors
///
/// `InvalidInput` if the result falls outside the supported date range.
pub(crate) fn days_after(date: NaiveDate, days: i64) -> Result<NaiveDate> {
    Duration::try_days(days)
        .and_then(|offset| date.checked_add_signed(offset))
        .ok_or_else(|| Error::InvalidInput(format!("{date} plus {days} days is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_validation() {
        assert!(AnalysisWindow::new(0, 6).is_ok());
        assert!(AnalysisWindow::new(0, -1).is_err());
        assert!(AnalysisWindow::new(-1, 3).is_err());
        assert_eq!(AnalysisWindow::new(7, 13).unwrap().length(), 7);
    }

    #[test]
    fn test_for_ts_first_week() {
        let limits = TimeLimits::for_ts(date(2020, 3, 30), date(2020, 4, 12), Cadence::Week, 8)
            .unwrap();
        assert_eq!(limits.last_enrollment_date(), date(2020, 4, 6));
        assert_eq!(limits.analysis_windows(), &[AnalysisWindow::new(0, 6).unwrap()]);
        assert_eq!(limits.last_date_data_required(), date(2020, 4, 12));
        assert_eq!(limits.num_dates_enrollment(), 8);
    }

    #[test]
    fn test_for_ts_insufficient_data() {
        let err = TimeLimits::for_ts(date(2020, 3, 30), date(2020, 4, 11), Cadence::Week, 8)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientData(_)));
    }

    #[test]
    fn test_for_ts_rejects_overall() {
        let err = TimeLimits::for_ts(date(2020, 3, 30), date(2020, 6, 1), Cadence::Overall, 8)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_for_ts_daily_windows() {
        let limits =
            TimeLimits::for_ts(date(2020, 1, 1), date(2020, 1, 10), Cadence::Day, 3).unwrap();
        // enrollment closes 01-03, data 01-03..01-10 = 8 days
        assert_eq!(limits.analysis_windows().len(), 8);
        assert_eq!(limits.last_window().unwrap().start(), 7);
    }

    #[test]
    fn test_single_window() {
        let limits = TimeLimits::for_single_analysis_window(
            date(2020, 1, 1),
            date(2020, 2, 1),
            0,
            20,
            8,
        )
        .unwrap();
        assert_eq!(limits.analysis_windows().len(), 1);
        assert_eq!(limits.last_date_data_required(), date(2020, 1, 27));
        assert!(TimeLimits::for_single_analysis_window(
            date(2020, 1, 1),
            date(2020, 1, 20),
            0,
            20,
            8
        )
        .is_err());
    }

    #[test]
    fn test_enrollment_beyond_date_range() {
        let err = TimeLimits::for_ts(date(2020, 3, 30), date(2020, 6, 1), Cadence::Week, u32::MAX)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = TimeLimits::for_single_analysis_window(
            date(2020, 3, 30),
            date(2020, 6, 1),
            0,
            i64::MAX,
            8,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_last_window_only() {
        let limits =
            TimeLimits::for_ts(date(2020, 1, 1), date(2020, 2, 1), Cadence::Week, 8).unwrap();
        assert_eq!(limits.analysis_windows().len(), 3);
        let last = limits.last_window_only();
        assert_eq!(last.analysis_windows(), &[AnalysisWindow::new(14, 20).unwrap()]);
        assert_eq!(last.first_date_data_required(), date(2020, 1, 15));
        assert_eq!(last.last_date_data_required(), limits.last_date_data_required());
    }
}
