//! Batch command tests: run, rerun, config validation, and export

use arrow::array::{Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Duration, NaiveDate, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use trueno_analysis::analysis::AnalysisEnvironment;
use trueno_analysis::config::{AnalysisSpec, ExternalConfig, ExternalConfigCollection};
use trueno_analysis::executor::commands::Commands;
use trueno_analysis::experiment::{Experiment, ExperimentCollection, ExperimentStatus};
use trueno_analysis::export::{LocalObjectStore, ObjectStore};
use trueno_analysis::graph::WorkerPool;
use trueno_analysis::warehouse::{MemoryWarehouse, Warehouse};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn experiments() -> ExperimentCollection {
    ExperimentCollection::new(vec![
        Experiment::builder("spam")
            .status(ExperimentStatus::Live)
            .start_date(date(2020, 3, 30))
            .end_date(date(2020, 4, 20))
            .proposed_enrollment(7)
            .branch("control", 0.5)
            .branch("treatment", 0.5)
            .build(),
        Experiment::builder("eggs")
            .status(ExperimentStatus::Live)
            .start_date(date(2020, 3, 30))
            .proposed_enrollment(7)
            .branch("control", 1.0)
            .build(),
    ])
}

fn metrics_frame() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("branch", DataType::Utf8, false),
        Field::new("active_hours", DataType::Float64, true),
        Field::new("uri_count", DataType::Float64, true),
        Field::new("search_count", DataType::Float64, true),
    ]));
    let values = || Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0, 4.0]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(vec!["control", "treatment", "control", "treatment"])),
            values(),
            values(),
            values(),
        ],
    )
    .unwrap()
}

struct Fixture {
    warehouse: Arc<MemoryWarehouse>,
    store: TempDir,
    commands: Commands,
}

fn fixture_with_configs(configs: ExternalConfigCollection) -> Fixture {
    let frame = metrics_frame();
    let warehouse = Arc::new(
        MemoryWarehouse::new("project", "dataset").with_query_handler(move |_| Some(frame.clone())),
    );
    let store = TempDir::new().unwrap();
    let env = AnalysisEnvironment::with_pool(
        Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        Arc::new(WorkerPool::new(2).unwrap()),
    );
    let commands = Commands::new(
        env,
        Arc::new(experiments()),
        Arc::new(configs),
        Arc::new(LocalObjectStore::new(store.path())),
    );
    Fixture {
        warehouse,
        store,
        commands,
    }
}

fn fixture() -> Fixture {
    fixture_with_configs(ExternalConfigCollection::default())
}

#[test]
fn test_run_single_experiment() {
    let f = fixture();
    assert!(f.commands.run(date(2020, 4, 12), Some("spam"), None, false).unwrap());

    let tables = f.warehouse.table_names().unwrap();
    assert!(tables.contains(&"spam_week_1".to_string()));
    assert!(tables.contains(&"statistics_spam_week_1".to_string()));
    assert!(!tables.iter().any(|t| t.contains("eggs")));
    assert!(f.store.path().join("metadata/metadata_spam.json").is_file());
}

#[test]
fn test_run_with_custom_config() {
    let f = fixture();
    let config = AnalysisSpec::from_toml("[experiment]\nskip = true").unwrap();
    assert!(f
        .commands
        .run(date(2020, 4, 12), Some("spam"), Some(config), false)
        .unwrap());
    assert!(f.warehouse.is_empty());
}

#[test]
fn test_run_all_experiments() {
    let f = fixture();
    assert!(f.commands.run(date(2020, 4, 12), None, None, false).unwrap());
    let tables = f.warehouse.table_names().unwrap();
    assert!(tables.contains(&"statistics_spam_week_1".to_string()));
    assert!(tables.contains(&"statistics_eggs_week_1".to_string()));
}

#[test]
fn test_rerun_covers_every_window() {
    let f = fixture();
    assert!(f.commands.rerun("spam", None, None, false).unwrap());

    let tables = f.warehouse.table_names().unwrap();
    for table in [
        "spam_week_1",
        "spam_week_2",
        "statistics_spam_week_1",
        "statistics_spam_week_2",
    ] {
        assert!(tables.contains(&table.to_string()), "missing {table}");
    }
    assert!(!tables.contains(&"spam_week_3".to_string()));
}

#[test]
fn test_rerun_recreates_enrollments() {
    let f = fixture();
    f.commands.run(date(2020, 4, 12), Some("spam"), None, false).unwrap();
    let before = f.warehouse.write_count();
    f.commands.rerun("spam", None, None, true).unwrap();

    let deletions_and_writes = f.warehouse.write_count() - before;
    assert!(deletions_and_writes > 0);
    assert!(f.warehouse.table_names().unwrap().contains(&"enrollments_spam".to_string()));
}

#[test]
fn test_rerun_config_changed() {
    let changed = ExternalConfig {
        slug: "spam".to_string(),
        spec: AnalysisSpec::default(),
        last_modified: Utc::now() + Duration::hours(1),
    };
    let untouched = ExternalConfig {
        slug: "eggs".to_string(),
        spec: AnalysisSpec::default(),
        last_modified: Utc::now() + Duration::hours(1),
    };
    let f = fixture_with_configs(ExternalConfigCollection::new(vec![changed, untouched]));
    // eggs has never been analysed, so only spam counts as updated
    f.warehouse.insert_table("spam_week_1", metrics_frame());

    assert!(f.commands.rerun_config_changed(None, false).unwrap());
    let tables = f.warehouse.table_names().unwrap();
    assert!(tables.contains(&"statistics_spam_week_2".to_string()));
    assert!(!tables.iter().any(|t| t.contains("eggs")));
}

#[test]
fn test_rerun_config_changed_without_updates() {
    let f = fixture();
    assert!(f.commands.rerun_config_changed(None, false).unwrap());
    assert_eq!(f.warehouse.write_count(), 0);
}

#[test]
fn test_ensure_enrollments_command() {
    let f = fixture();
    f.commands.ensure_enrollments(Some("eggs"), None, false).unwrap();
    assert_eq!(f.warehouse.table_names().unwrap(), vec!["enrollments_eggs".to_string()]);
}

#[test]
fn test_validate_config() {
    let f = fixture();
    let dir = TempDir::new().unwrap();
    let valid = dir.path().join("spam.toml");
    std::fs::write(&valid, "[metrics]\nweekly = [\"active_hours\"]\n").unwrap();
    let example = dir.path().join("spam.example.toml");
    std::fs::write(&example, "this is not toml [").unwrap();

    assert!(f
        .commands
        .validate_config(&[valid.clone(), example, dir.path().to_path_buf()])
        .unwrap());

    let unknown = dir.path().join("ham.toml");
    std::fs::write(&unknown, "[experiment]\nenrollment_period = 7\n").unwrap();
    assert!(!f.commands.validate_config(&[valid, unknown]).unwrap());
}

#[test]
fn test_validate_config_rejects_undefined_metric() {
    let f = fixture();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("spam.toml");
    std::fs::write(&path, "[metrics]\nweekly = [\"no_such_metric\"]\n").unwrap();
    assert!(!f.commands.validate_config(&[path]).unwrap());
}

#[test]
fn test_validate_config_accepts_skip_directive() {
    let f = fixture();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("spam.toml");
    std::fs::write(&path, "[experiment]\nskip = true\n").unwrap();
    assert!(f.commands.validate_config(&[path]).unwrap());
}

#[test]
fn test_export_statistics() {
    let f = fixture();
    f.commands.run(date(2020, 4, 12), Some("spam"), None, false).unwrap();

    let keys = f.commands.export_statistics("spam").unwrap();
    assert_eq!(keys, vec!["statistics/statistics_spam_week_1.json".to_string()]);

    let store = LocalObjectStore::new(f.store.path());
    let exported: serde_json::Value =
        serde_json::from_slice(&store.get(&keys[0]).unwrap()).unwrap();
    assert!(exported.as_array().is_some_and(|rows| !rows.is_empty()));
}

#[test]
fn test_export_statistics_nothing_to_export() {
    let f = fixture();
    assert!(f.commands.export_statistics("spam").unwrap().is_empty());
}
