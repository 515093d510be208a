//! Export of statistics and experiment metadata to object storage
//!
//! Consumers (dashboards) read JSON documents rather than querying the
//! warehouse directly.
//!
//! ## Keys
//!
//! - `statistics/{statistics_table}.json`: JSON array of statistic rows
//! - `metadata/metadata_{slug}.json`: metric descriptions for one experiment

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cadence::Cadence;
use crate::config::ExperimentConfiguration;
use crate::naming::{normalize_name, STATISTICS_PREFIX};
use crate::statistics::StatisticResult;
use crate::warehouse::Warehouse;
use crate::{Error, Result};

/// Version of the metadata document layout.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Blob storage for exported documents.
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any existing object.
    ///
    /// # Errors
    ///
    /// Returns error if the object cannot be written.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Read the object stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the object does not exist or cannot be read.
    fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Object store backed by a local directory; keys are relative paths.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Store objects below `root`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::InvalidInput(format!("Invalid object key {key:?}")));
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        debug!(key, bytes = bytes.len(), "Stored object");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.path(key)?)?)
    }
}

/// Export every statistics table of an experiment as a JSON array.
///
/// Returns the keys written.
///
/// # Errors
///
/// Returns error if a table cannot be read or an object cannot be written.
pub fn export_statistics_tables(
    warehouse: &dyn Warehouse,
    store: &dyn ObjectStore,
    slug: &str,
) -> Result<Vec<String>> {
    let prefix = format!("{STATISTICS_PREFIX}_{}_", normalize_name(slug));
    let mut tables: Vec<String> = warehouse
        .table_names()?
        .into_iter()
        .filter(|name| {
            name.strip_prefix(&prefix)
                .is_some_and(is_window_suffix)
        })
        .collect();
    tables.sort();

    let mut keys = Vec::with_capacity(tables.len());
    for table in tables {
        let rows = StatisticResult::from_record_batch(&warehouse.read_table(&table)?)?;
        let key = format!("statistics/{table}.json");
        store.put(&key, &serde_json::to_vec(&rows)?)?;
        keys.push(key);
    }
    info!(experiment = slug, tables = keys.len(), "Exported statistics");
    Ok(keys)
}

/// `{cadence}_{window_index}`, as in per-window table names.
fn is_window_suffix(suffix: &str) -> bool {
    Cadence::ALL.iter().any(|cadence| {
        suffix
            .strip_prefix(cadence.value())
            .and_then(|rest| rest.strip_prefix('_'))
            .is_some_and(|index| index.parse::<usize>().is_ok())
    })
}

/// Description of one metric for consumers of exported statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMetadata {
    /// Human-readable name
    pub friendly_name: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Statistics computed over the metric
    pub statistics: Vec<String>,
}

/// Metadata document of one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    /// Layout version
    pub schema_version: u32,
    /// Branch comparisons are relative to
    pub reference_branch: Option<String>,
    /// Metrics by name
    pub metrics: BTreeMap<String, MetricMetadata>,
}

impl From<&ExperimentConfiguration> for ExperimentMetadata {
    fn from(config: &ExperimentConfiguration) -> Self {
        let mut metrics: BTreeMap<String, MetricMetadata> = BTreeMap::new();
        for summary in config.metrics().values().flatten() {
            let entry = metrics
                .entry(summary.metric.name.clone())
                .or_insert_with(|| MetricMetadata {
                    friendly_name: summary.metric.friendly_name.clone(),
                    description: summary.metric.description.clone(),
                    statistics: Vec::new(),
                });
            if !entry.statistics.contains(&summary.statistic.name) {
                entry.statistics.push(summary.statistic.name.clone());
            }
        }
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            reference_branch: config.reference_branch().map(str::to_string),
            metrics,
        }
    }
}

/// Write the metadata document of an experiment; returns its key.
///
/// # Errors
///
/// Returns error if the experiment has no slug or the object cannot be
/// written.
pub fn export_metadata(config: &ExperimentConfiguration, store: &dyn ObjectStore) -> Result<String> {
    let slug = config.normandy_slug().ok_or_else(|| Error::NoSlug {
        experiment: config.experimenter_slug().to_string(),
    })?;
    let key = format!("metadata/metadata_{}.json", normalize_name(slug));
    let metadata = ExperimentMetadata::from(config);
    store.put(&key, &serde_json::to_vec_pretty(&metadata)?)?;
    debug!(experiment = slug, key = %key, "Exported metadata");
    Ok(key)
}
