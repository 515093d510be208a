//! Readiness and statistics benchmarks
//!
//! - Readiness over a year of daily checks
//! - Segment subsetting of metric frames
//! - Per-branch mean over metric frames
//!
//! Toyota Way: Measure before optimizing (Genchi Genbutsu)

use arrow::array::{BooleanArray, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Duration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use trueno_analysis::analysis::subset_segment;
use trueno_analysis::cadence::Cadence;
use trueno_analysis::config::{AnalysisSpec, StatisticSpec};
use trueno_analysis::experiment::{Experiment, ExperimentStatus};
use trueno_analysis::readiness::{readiness, ExperimentSchedule};
use trueno_analysis::statistics::{Statistic, StatisticRegistry};

/// Create a metrics frame with specified number of rows
#[allow(clippy::cast_precision_loss)]
fn create_metrics_frame(num_rows: usize) -> RecordBatch {
    let schema = Schema::new(vec![
        Field::new("branch", DataType::Utf8, false),
        Field::new("active_hours", DataType::Float64, true),
        Field::new("regular_users_v3", DataType::Boolean, true),
    ]);

    let branches = StringArray::from_iter_values(
        (0..num_rows).map(|i| if i % 2 == 0 { "control" } else { "treatment" }),
    );
    let hours = Float64Array::from_iter_values((0..num_rows).map(|i| (i % 97) as f64 * 0.25));
    let regular = BooleanArray::from((0..num_rows).map(|i| i % 3 == 0).collect::<Vec<_>>());

    RecordBatch::try_new(
        Arc::new(schema),
        vec![Arc::new(branches), Arc::new(hours), Arc::new(regular)],
    )
    .unwrap()
}

fn schedule() -> ExperimentSchedule {
    ExperimentSchedule {
        slug: "bench-experiment".to_string(),
        start_date: NaiveDate::from_ymd_opt(2020, 3, 30),
        end_date: None,
        proposed_enrollment: 7,
        status: Some(ExperimentStatus::Live),
    }
}

/// Benchmark readiness over a year of daily checks
fn bench_readiness(c: &mut Criterion) {
    let mut group = c.benchmark_group("readiness");
    let schedule = schedule();
    let start = NaiveDate::from_ymd_opt(2020, 3, 30).unwrap();

    for cadence in [Cadence::Day, Cadence::Week, Cadence::Days28] {
        group.bench_with_input(
            BenchmarkId::new("year_of_days", cadence),
            &cadence,
            |b, &cadence| {
                b.iter(|| {
                    (0..365)
                        .filter(|offset| {
                            readiness(cadence, &schedule, start + Duration::days(*offset))
                                .unwrap()
                                .is_some()
                        })
                        .count()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark segment subsetting
fn bench_subset_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("subset_segment");

    for size in [10_000, 100_000, 1_000_000] {
        let frame = create_metrics_frame(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| subset_segment(black_box(frame), "regular_users_v3").unwrap());
        });
    }

    group.finish();
}

/// Benchmark the mean statistic
fn bench_mean(c: &mut Criterion) {
    let mut group = c.benchmark_group("mean");
    let experiment = Experiment::builder("bench-experiment")
        .start_date(NaiveDate::from_ymd_opt(2020, 3, 30).unwrap())
        .proposed_enrollment(7)
        .branch("control", 0.5)
        .branch("treatment", 0.5)
        .build();
    let config = AnalysisSpec::default().resolve(&experiment).unwrap();
    let mean = StatisticRegistry::default()
        .build(&StatisticSpec {
            name: "mean".to_string(),
            params: serde_json::Value::Null,
        })
        .unwrap();

    for size in [10_000, 100_000, 1_000_000] {
        let frame = create_metrics_frame(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| mean.compute(black_box(frame), "active_hours", &config).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_readiness, bench_subset_segment, bench_mean);
criterion_main!(benches);
