//! Task graph for one analysis run
//!
//! ## Shape (per ready cadence)
//!
//! ```text
//! CalculateMetrics ──> LoadTable ──┬─> SubsetSegment(all) ──┬─> Statistics(metric, stat) ─┐
//!                                  │                        └─> Counts ───────────────────┤
//!                                  └─> SubsetSegment(seg) ──┬─> Statistics(...) ──────────┤
//!                                                           └─> Counts ───────────────────┴─> SaveStatistics
//! ```
//!
//! Nodes are immutable and may only depend on nodes added before them, so
//! every graph is acyclic by construction. A graph is plain data: it can
//! be executed by a [`WorkerPool`] or serialized for remote execution.

mod pool;

pub use pool::{WorkerPool, PROCESSES_ENV};

use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::cadence::Cadence;
use crate::config::Summary;
use crate::statistics::StatisticResult;
use crate::timelimits::TimeLimits;
use crate::{Error, Result};

/// Index of a node within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    /// Position in the graph.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Run the metric query for the newest window into its result table.
    /// Output: `Table`.
    CalculateMetrics {
        /// Cadence of the window
        cadence: Cadence,
        /// Limits as of the run date (all closed windows)
        time_limits: TimeLimits,
        /// Log instead of querying
        dry_run: bool,
    },
    /// Read the result table of the dependency. Output: `Frame`.
    LoadTable,
    /// Filter rows to a segment. Output: `Frame`.
    SubsetSegment {
        /// Segment name, or `all`
        segment: String,
    },
    /// Run one statistic over one metric. Output: `Results`.
    Statistics {
        /// Metric and statistic
        summary: Summary,
        /// Segment label of the results
        segment: String,
    },
    /// Count clients per branch. Output: `Results`.
    Counts {
        /// Segment label of the results
        segment: String,
    },
    /// Write all dependency results to the statistics table. Output: `Saved`.
    ///
    /// The first dependency is the `CalculateMetrics` node naming the
    /// result table.
    SaveStatistics {
        /// Cadence of the window
        cadence: Cadence,
    },
}

impl Task {
    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::CalculateMetrics { cadence, .. } => format!("calculate_metrics[{cadence}]"),
            Self::LoadTable => "load_table".to_string(),
            Self::SubsetSegment { segment } => format!("subset[{segment}]"),
            Self::Statistics { summary, segment } => format!(
                "statistics[{}/{}/{segment}]",
                summary.metric.name, summary.statistic.name
            ),
            Self::Counts { segment } => format!("counts[{segment}]"),
            Self::SaveStatistics { cadence } => format!("save_statistics[{cadence}]"),
        }
    }
}

/// A task and the nodes whose outputs it consumes, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    task: Task,
    dependencies: Vec<NodeId>,
}

impl Node {
    /// The task.
    #[must_use]
    pub const fn task(&self) -> &Task {
        &self.task
    }

    /// Nodes this one consumes.
    #[must_use]
    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }
}

/// Output of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Name of a warehouse table
    Table(String),
    /// Tabular data
    Frame(RecordBatch),
    /// Statistics rows
    Results(Vec<StatisticResult>),
    /// Name of a written statistics table
    Saved(String),
}

impl NodeOutput {
    /// Table name, if this is a `Table` output.
    #[must_use]
    pub fn as_table(&self) -> Option<&str> {
        match self {
            Self::Table(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Frame, if this is a `Frame` output.
    #[must_use]
    pub const fn as_frame(&self) -> Option<&RecordBatch> {
        match self {
            Self::Frame(batch) => Some(batch),
            _ => None,
        }
    }

    /// Statistics rows, if this is a `Results` output.
    #[must_use]
    pub fn as_results(&self) -> Option<&[StatisticResult]> {
        match self {
            Self::Results(rows) => Some(rows.as_slice()),
            _ => None,
        }
    }
}

/// Executes single tasks; the scheduler supplies dependency outputs.
pub trait TaskExecutor: Sync {
    /// Execute `task` given its dependencies' outputs, in declared order.
    ///
    /// # Errors
    ///
    /// Any error fails the whole graph.
    fn execute(&self, task: &Task, inputs: &[&NodeOutput]) -> Result<NodeOutput>;
}

/// An immutable, acyclic task graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    /// Start building a graph.
    #[must_use]
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::default()
    }

    /// Nodes in insertion (topological) order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of nodes with no dependencies.
    #[must_use]
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.dependencies.is_empty())
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Ids of nodes consuming each node's output.
    #[must_use]
    pub fn dependents(&self) -> Vec<Vec<NodeId>> {
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                dependents[dep.0].push(NodeId(i));
            }
        }
        dependents
    }

    /// JSON description for remote execution.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builds a [`TaskGraph`] node by node.
///
/// # Example
///
/// ```
/// use trueno_analysis::graph::{Task, TaskGraph};
///
/// # fn example() -> trueno_analysis::Result<()> {
/// let mut builder = TaskGraph::builder();
/// let load = builder.add(Task::LoadTable, &[])?;
/// let all = builder.add(Task::SubsetSegment { segment: "all".to_string() }, &[load])?;
/// builder.add(Task::Counts { segment: "all".to_string() }, &[all])?;
/// let graph = builder.build();
/// assert_eq!(graph.len(), 3);
/// assert_eq!(graph.roots(), vec![load]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    nodes: Vec<Node>,
}

impl TaskGraphBuilder {
    /// Add a node consuming `dependencies`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a dependency is not already in the graph.
    pub fn add(&mut self, task: Task, dependencies: &[NodeId]) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        if let Some(unknown) = dependencies.iter().find(|dep| dep.0 >= id.0) {
            return Err(Error::InvalidInput(format!(
                "{} depends on unknown node {}",
                task.label(),
                unknown.0
            )));
        }
        self.nodes.push(Node {
            task,
            dependencies: dependencies.to_vec(),
        });
        Ok(id)
    }

    /// Number of nodes added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no nodes were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Finish the graph.
    #[must_use]
    pub fn build(self) -> TaskGraph {
        TaskGraph { nodes: self.nodes }
    }
}
