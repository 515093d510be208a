//! Remote execution via workflow submission
//!
//! Nothing runs locally: the worklist is grouped by experiment and
//! submitted as one workflow. Custom configurations cannot travel with
//! the request and are rejected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ConfigurationMap, ExecutorStrategy, WorkItem};
use crate::{Error, Result};

/// Dates to analyse for one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentDates {
    /// Experiment slug
    pub slug: String,
    /// Dates as `YYYY-MM-DD`
    pub dates: Vec<String>,
}

/// Parameters of a submitted analysis workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Work grouped by experiment, in slug order
    pub experiments: Vec<ExperimentDates>,
    /// Warehouse project
    pub project_id: String,
    /// Warehouse dataset
    pub dataset_id: String,
    /// Bucket receiving exports
    pub bucket: String,
}

impl WorkflowRequest {
    /// Group `worklist` by slug.
    #[must_use]
    pub fn from_worklist(worklist: &[WorkItem], project_id: &str, dataset_id: &str, bucket: &str) -> Self {
        let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (slug, date) in worklist {
            grouped
                .entry(slug.as_str())
                .or_default()
                .push(date.format("%Y-%m-%d").to_string());
        }
        Self {
            experiments: grouped
                .into_iter()
                .map(|(slug, dates)| ExperimentDates {
                    slug: slug.to_string(),
                    dates,
                })
                .collect(),
            project_id: project_id.to_string(),
            dataset_id: dataset_id.to_string(),
            bucket: bucket.to_string(),
        }
    }
}

/// State of a submitted workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Still running
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with a failure
    Failed,
}

/// Client of the remote workflow service.
pub trait WorkflowClient: Send + Sync {
    /// Submit a workflow; returns its identifier.
    ///
    /// # Errors
    ///
    /// `Workflow` if the submission is rejected.
    fn submit(&self, request: &WorkflowRequest) -> Result<String>;

    /// Current status of a submitted workflow.
    ///
    /// # Errors
    ///
    /// `Workflow` if the status cannot be retrieved.
    fn status(&self, workflow_id: &str) -> Result<WorkflowStatus>;
}

/// Submits the worklist to a remote workflow service.
pub struct RemoteExecutorStrategy {
    client: Arc<dyn WorkflowClient>,
    project_id: String,
    dataset_id: String,
    bucket: String,
    monitor_status: bool,
    poll_interval: Duration,
}

impl RemoteExecutorStrategy {
    /// Create a strategy submitting through `client`.
    #[must_use]
    pub fn new(
        client: Arc<dyn WorkflowClient>,
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            client,
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            bucket: bucket.into(),
            monitor_status: false,
            poll_interval: Duration::from_secs(30),
        }
    }

    /// Wait for the workflow to finish and report its outcome.
    #[must_use]
    pub const fn monitor_status(mut self, monitor: bool) -> Self {
        self.monitor_status = monitor;
        self
    }

    /// Time between status polls.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn wait(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        loop {
            let status = self.client.status(workflow_id)?;
            if status != WorkflowStatus::Running {
                return Ok(status);
            }
            debug!(workflow = workflow_id, "Workflow still running");
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl ExecutorStrategy for RemoteExecutorStrategy {
    fn execute(
        &self,
        worklist: &[WorkItem],
        configuration_map: Option<&ConfigurationMap>,
    ) -> Result<bool> {
        if configuration_map.is_some_and(|map| !map.is_empty()) {
            return Err(Error::RemoteConfigOverride);
        }

        let request =
            WorkflowRequest::from_worklist(worklist, &self.project_id, &self.dataset_id, &self.bucket);
        let workflow_id = self.client.submit(&request)?;
        info!(
            workflow = %workflow_id,
            experiments = request.experiments.len(),
            "Submitted analysis workflow"
        );

        if !self.monitor_status {
            return Ok(true);
        }
        let status = self.wait(&workflow_id)?;
        if status == WorkflowStatus::Failed {
            warn!(workflow = %workflow_id, "Analysis workflow failed");
        }
        Ok(status == WorkflowStatus::Succeeded)
    }
}
