//! External per-experiment configuration files
//!
//! A directory of `{slug}.toml` files, each overriding the platform
//! defaults for one experiment.

use chrono::{DateTime, Utc};
use std::path::Path;

use super::AnalysisSpec;
use crate::warehouse::Warehouse;
use crate::Result;

/// Source of external configurations.
pub trait ExternalConfigSource: Send + Sync {
    /// Fetch the current collection.
    ///
    /// # Errors
    ///
    /// Returns error if the configurations cannot be loaded.
    fn configs(&self) -> Result<ExternalConfigCollection>;
}

/// One experiment's override spec.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalConfig {
    /// Experiment slug (file stem)
    pub slug: String,
    /// Parsed spec
    pub spec: AnalysisSpec,
    /// When the file was last changed
    pub last_modified: DateTime<Utc>,
}

impl ExternalConfig {
    /// Load `path`, taking the slug from the file stem.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let slug = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        let last_modified = std::fs::metadata(path)?.modified()?.into();
        Ok(Self {
            slug,
            spec: AnalysisSpec::from_toml_file(path)?,
            last_modified,
        })
    }
}

/// All external configurations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalConfigCollection {
    configs: Vec<ExternalConfig>,
}

impl ExternalConfigCollection {
    /// Create a collection.
    #[must_use]
    pub const fn new(configs: Vec<ExternalConfig>) -> Self {
        Self { configs }
    }

    /// Load every `*.toml` in `dir`, ignoring `*.example.toml`.
    ///
    /// # Errors
    ///
    /// Returns error if the directory or any file cannot be read.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_toml = path.extension().is_some_and(|ext| ext == "toml");
            let is_example = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem.ends_with(".example"));
            if path.is_file() && is_toml && !is_example {
                paths.push(path);
            }
        }
        paths.sort();
        let configs = paths
            .iter()
            .map(ExternalConfig::from_path)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(configs))
    }

    /// All configurations.
    #[must_use]
    pub fn configs(&self) -> &[ExternalConfig] {
        &self.configs
    }

    /// Override spec for an experiment, if one exists.
    #[must_use]
    pub fn spec_for_experiment(&self, slug: &str) -> Option<&AnalysisSpec> {
        self.configs.iter().find(|c| c.slug == slug).map(|c| &c.spec)
    }

    /// Configurations changed after the experiment's tables were written.
    ///
    /// Experiments without any tables have never been analysed and are
    /// left to the regular daily run.
    ///
    /// # Errors
    ///
    /// Returns error if table metadata cannot be read.
    pub fn updated_configs(&self, warehouse: &dyn Warehouse) -> Result<Vec<&ExternalConfig>> {
        let mut updated = Vec::new();
        for config in &self.configs {
            if let Some(tables_updated) = warehouse.experiment_tables_first_updated(&config.slug)? {
                if config.last_modified > tables_updated {
                    updated.push(config);
                }
            }
        }
        Ok(updated)
    }
}

impl ExternalConfigSource for ExternalConfigCollection {
    fn configs(&self) -> Result<ExternalConfigCollection> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MemoryWarehouse;
    use arrow::datatypes::Schema;
    use arrow::record_batch::RecordBatch;
    use chrono::Duration;
    use std::sync::Arc;

    fn config(slug: &str, last_modified: DateTime<Utc>) -> ExternalConfig {
        ExternalConfig {
            slug: slug.to_string(),
            spec: AnalysisSpec::default(),
            last_modified,
        }
    }

    #[test]
    fn test_spec_for_experiment() {
        let collection = ExternalConfigCollection::new(vec![config("spam", Utc::now())]);
        assert!(collection.spec_for_experiment("spam").is_some());
        assert!(collection.spec_for_experiment("eggs").is_none());
    }

    #[test]
    fn test_updated_configs() {
        let warehouse = MemoryWarehouse::new("p", "d");
        warehouse.insert_table("spam_week_1", RecordBatch::new_empty(Arc::new(Schema::empty())));
        warehouse.insert_table("eggs_week_1", RecordBatch::new_empty(Arc::new(Schema::empty())));
        let collection = ExternalConfigCollection::new(vec![
            config("spam", Utc::now() + Duration::days(1)),
            config("eggs", Utc::now() - Duration::days(1)),
            config("never-run", Utc::now()),
        ]);
        let updated = collection.updated_configs(&warehouse).unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].slug, "spam");
    }

    #[test]
    fn test_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("spam.toml"), "[experiment]\nskip = true\n").unwrap();
        std::fs::write(dir.path().join("eggs.example.toml"), "[experiment]\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();
        let collection = ExternalConfigCollection::from_dir(dir.path()).unwrap();
        assert_eq!(collection.configs().len(), 1);
        assert_eq!(collection.configs()[0].slug, "spam");
        assert_eq!(collection.configs()[0].spec.experiment.skip, Some(true));
    }
}
