//! Experiment metadata from the experiment registry
//!
//! ## Schema Overview
//!
//! ```text
//! ExperimentCollection (1) ──< Experiment (N) ──< Branch (N)
//! ```
//!
//! Experiments are read-only inputs: the registry owns them and the
//! analysis only filters and resolves them.
//!
//! ## Usage
//!
//! ```rust
//! use chrono::NaiveDate;
//! use trueno_analysis::experiment::{Experiment, ExperimentCollection, ExperimentStatus};
//!
//! let experiment = Experiment::builder("spam")
//!     .status(ExperimentStatus::Live)
//!     .start_date(NaiveDate::from_ymd_opt(2020, 3, 30).unwrap())
//!     .proposed_enrollment(7)
//!     .branch("control", 0.5)
//!     .branch("treatment", 0.5)
//!     .build();
//!
//! let collection = ExperimentCollection::new(vec![experiment]);
//! assert_eq!(collection.with_slug("spam").experiments().len(), 1);
//! ```

mod experiment_record;
mod store;

pub use experiment_record::{Branch, Experiment, ExperimentBuilder, ExperimentStatus};
pub use store::{ExperimentCollection, ExperimentSource, RECOGNIZED_EXPERIMENT_TYPES};
