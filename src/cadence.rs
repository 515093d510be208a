//! Analysis cadences
//!
//! A cadence is how often an experiment is re-analysed. The periodic
//! cadences accumulate windows over calendar time; `Overall` fires once,
//! on the day the experiment completes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Periodicity of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// One window per day after enrollment
    Day,
    /// One window per week after enrollment
    Week,
    /// One window per 28 days after enrollment
    Days28,
    /// A single window spanning the whole post-enrollment period
    Overall,
}

impl Cadence {
    /// All cadences, finest first.
    pub const ALL: [Self; 4] = [Self::Day, Self::Week, Self::Days28, Self::Overall];

    /// Name used in table names (`{slug}_{value}_{index}`).
    #[must_use]
    pub const fn value(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Days28 => "days28",
            Self::Overall => "overall",
        }
    }

    /// Name used in rolling view names and config files.
    #[must_use]
    pub const fn adjective(self) -> &'static str {
        match self {
            Self::Day => "daily",
            Self::Week => "weekly",
            Self::Days28 => "28_day",
            Self::Overall => "overall",
        }
    }

    /// Window length in days; `None` for the terminal cadence.
    #[must_use]
    pub const fn window_length(self) -> Option<i64> {
        match self {
            Self::Day => Some(1),
            Self::Week => Some(7),
            Self::Days28 => Some(28),
            Self::Overall => None,
        }
    }

    /// Whether windows accumulate over time.
    #[must_use]
    pub const fn is_periodic(self) -> bool {
        self.window_length().is_some()
    }

    /// Finest periodic cadence; drives enrollment materialization.
    #[must_use]
    pub const fn finest_periodic() -> Self {
        Self::Day
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

impl FromStr for Cadence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.value() == s || c.adjective() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown cadence: {s}")))
    }
}
