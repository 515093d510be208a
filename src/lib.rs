//! # Trueno-Analysis: Incremental Experiment Analysis
//!
//! Trueno-Analysis decides, every day, whether an online experiment has
//! accumulated enough data to close a new analysis window, then computes
//! that window's metrics and statistics as one task graph and publishes
//! the results as versioned warehouse tables behind rolling views.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Genchi Genbutsu**: readiness is re-derived from the schedule and the
//!   date on every call; nothing is remembered between runs
//! - **Jidoka**: preconditions stop an analysis before any side effect
//! - **Poka-Yoke**: deterministic table names make every rerun an overwrite
//! - **Heijunka**: one bounded worker pool shared by all runs in a process
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::NaiveDate;
//! use trueno_analysis::analysis::{Analysis, AnalysisEnvironment};
//! use trueno_analysis::config::AnalysisSpec;
//! use trueno_analysis::experiment::{Experiment, ExperimentStatus};
//! use trueno_analysis::graph::WorkerPool;
//! use trueno_analysis::warehouse::MemoryWarehouse;
//!
//! # fn example() -> trueno_analysis::Result<()> {
//! let experiment = Experiment::builder("spam")
//!     .status(ExperimentStatus::Live)
//!     .start_date(NaiveDate::from_ymd_opt(2020, 3, 30).unwrap())
//!     .proposed_enrollment(7)
//!     .branch("control", 0.5)
//!     .branch("treatment", 0.5)
//!     .build();
//! let config = AnalysisSpec::default_for_experiment(&experiment)?.resolve(&experiment)?;
//!
//! let warehouse = Arc::new(MemoryWarehouse::new("project", "dataset"));
//! let env = AnalysisEnvironment::with_pool(warehouse.clone(), Arc::new(WorkerPool::new(2)?));
//! let analysis = Analysis::new(env, config);
//!
//! // The first weekly window closes on 2020-04-12
//! let tables = analysis.run(NaiveDate::from_ymd_opt(2020, 4, 12).unwrap(), true)?;
//! assert_eq!(tables, vec!["spam_week_1".to_string()]);
//! assert_eq!(warehouse.write_count(), 0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod analysis;
pub mod cadence;
pub mod config;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod export;
pub mod graph;
pub mod logging;
pub mod naming;
pub mod readiness;
pub mod sql;
pub mod statistics;
pub mod timelimits;
pub mod warehouse;

pub use error::{Error, Result};
