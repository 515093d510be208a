//! Worker pool executing task graphs
//!
//! One pool per process: created on first use by [`WorkerPool::shared`],
//! reused by every later run, never torn down explicitly. Callers that
//! want isolation construct their own pool and inject it.

use rayon::{Scope, ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

use super::{NodeId, NodeOutput, TaskExecutor, TaskGraph};
use crate::{Error, Result};

/// Environment variable sizing the shared pool (0 or unset: one per CPU).
pub const PROCESSES_ENV: &str = "TRUENO_ANALYSIS_PROCESSES";

static SHARED: OnceLock<Arc<WorkerPool>> = OnceLock::new();

/// A fixed-size pool of worker threads.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool with `num_threads` workers; 0 means one per CPU.
    ///
    /// # Errors
    ///
    /// Returns error if the threads cannot be spawned.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("analysis-worker-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("Failed to start worker pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Create a pool sized by `TRUENO_ANALYSIS_PROCESSES`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the variable is not a number.
    pub fn from_env() -> Result<Self> {
        let num_threads = match std::env::var(PROCESSES_ENV) {
            Ok(value) if !value.trim().is_empty() => value.trim().parse().map_err(|_| {
                Error::Config(format!("{PROCESSES_ENV} must be a number, got {value:?}"))
            })?,
            _ => 0,
        };
        Self::new(num_threads)
    }

    /// The process-wide pool, created on first use.
    ///
    /// # Errors
    ///
    /// Returns error if the pool has to be created and creation fails.
    pub fn shared() -> Result<Arc<Self>> {
        if let Some(pool) = SHARED.get() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(Self::from_env()?);
        info!(num_threads = pool.num_threads(), "Started shared worker pool");
        // Another thread may have won the race; use whichever pool was stored
        Ok(Arc::clone(SHARED.get_or_init(|| pool)))
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Execute every node of `graph`, each once its dependencies finished.
    ///
    /// Blocks until all nodes completed or, after a failure, until nodes
    /// already running have drained. Nodes are never retried.
    ///
    /// # Errors
    ///
    /// The first node error; its dependents never run.
    pub fn execute<E>(&self, graph: &TaskGraph, executor: &E) -> Result<Vec<NodeOutput>>
    where
        E: TaskExecutor + ?Sized,
    {
        let run = GraphRun::new(graph, executor);
        self.pool.scope(|scope| {
            for root in graph.roots() {
                run.spawn(scope, root.index());
            }
        });
        run.finish()
    }
}

/// Shared state of one graph execution.
struct GraphRun<'a, E: ?Sized> {
    graph: &'a TaskGraph,
    executor: &'a E,
    dependents: Vec<Vec<NodeId>>,
    remaining: Vec<AtomicUsize>,
    outputs: Vec<OnceLock<NodeOutput>>,
    failed: AtomicBool,
    failure: Mutex<Option<Error>>,
}

impl<'a, E: TaskExecutor + ?Sized> GraphRun<'a, E> {
    fn new(graph: &'a TaskGraph, executor: &'a E) -> Self {
        Self {
            graph,
            executor,
            dependents: graph.dependents(),
            remaining: graph
                .nodes()
                .iter()
                .map(|node| AtomicUsize::new(node.dependencies().len()))
                .collect(),
            outputs: (0..graph.len()).map(|_| OnceLock::new()).collect(),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    fn spawn<'s>(&'s self, scope: &Scope<'s>, index: usize) {
        scope.spawn(move |scope| self.run_node(scope, index));
    }

    fn run_node<'s>(&'s self, scope: &Scope<'s>, index: usize) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        match self.execute_node(index) {
            Ok(output) => {
                // Each node runs once, so the cell is always empty here
                let _ = self.outputs[index].set(output);
                for dependent in &self.dependents[index] {
                    if self.remaining[dependent.index()].fetch_sub(1, Ordering::SeqCst) == 1 {
                        self.spawn(scope, dependent.index());
                    }
                }
            }
            Err(e) => {
                self.failed.store(true, Ordering::SeqCst);
                if let Ok(mut failure) = self.failure.lock() {
                    failure.get_or_insert(e);
                }
            }
        }
    }

    fn execute_node(&self, index: usize) -> Result<NodeOutput> {
        let node = &self.graph.nodes()[index];
        let inputs = node
            .dependencies()
            .iter()
            .map(|dep| {
                self.outputs[dep.index()].get().ok_or_else(|| {
                    Error::Other(format!("Output of node {} is missing", dep.index()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(node = index, task = %node.task().label(), "Executing task");
        self.executor.execute(node.task(), &inputs)
    }

    fn finish(self) -> Result<Vec<NodeOutput>> {
        let failure = self
            .failure
            .into_inner()
            .map_err(|_| Error::Other("Task failure state poisoned".to_string()))?;
        if let Some(e) = failure {
            return Err(e);
        }
        self.outputs
            .into_iter()
            .enumerate()
            .map(|(i, cell)| {
                cell.into_inner()
                    .ok_or_else(|| Error::Other(format!("Node {i} never ran")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Task;
    use crate::statistics::StatisticResult;

    /// Fails on the segment named "boom".
    struct Recorder {
        executed: AtomicUsize,
    }

    impl TaskExecutor for Recorder {
        fn execute(&self, task: &Task, inputs: &[&NodeOutput]) -> Result<NodeOutput> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            match task {
                Task::LoadTable => Ok(NodeOutput::Table("t".to_string())),
                Task::SubsetSegment { segment } if segment == "boom" => {
                    Err(Error::UnknownSegment {
                        segment: segment.clone(),
                    })
                }
                Task::SubsetSegment { .. } => Ok(inputs[0].clone()),
                Task::Counts { segment } => Ok(NodeOutput::Results(vec![StatisticResult::point(
                    "identity", "count", segment, 1.0,
                )])),
                _ => {
                    let n = inputs
                        .iter()
                        .filter_map(|input| input.as_results())
                        .map(<[StatisticResult]>::len)
                        .sum::<usize>();
                    Ok(NodeOutput::Saved(n.to_string()))
                }
            }
        }
    }

    fn graph(segments: &[&str]) -> TaskGraph {
        let mut builder = TaskGraph::builder();
        let load = builder.add(Task::LoadTable, &[]).unwrap();
        let mut counts = Vec::new();
        for segment in segments {
            let subset = builder
                .add(Task::SubsetSegment { segment: (*segment).to_string() }, &[load])
                .unwrap();
            counts.push(
                builder
                    .add(Task::Counts { segment: (*segment).to_string() }, &[subset])
                    .unwrap(),
            );
        }
        builder
            .add(Task::SaveStatistics { cadence: crate::cadence::Cadence::Week }, &counts)
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_executes_in_dependency_order() {
        let pool = WorkerPool::new(4).unwrap();
        let recorder = Recorder {
            executed: AtomicUsize::new(0),
        };
        let outputs = pool.execute(&graph(&["all", "a", "b"]), &recorder).unwrap();
        assert_eq!(outputs.len(), 8);
        assert_eq!(outputs[7], NodeOutput::Saved("3".to_string()));
        assert_eq!(recorder.executed.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_failure_stops_dependents() {
        let pool = WorkerPool::new(2).unwrap();
        let recorder = Recorder {
            executed: AtomicUsize::new(0),
        };
        let err = pool.execute(&graph(&["all", "boom"]), &recorder).unwrap_err();
        assert!(matches!(err, Error::UnknownSegment { segment } if segment == "boom"));
        // Save never runs
        assert!(recorder.executed.load(Ordering::SeqCst) < 6);
    }

    #[test]
    fn test_empty_graph() {
        let pool = WorkerPool::new(1).unwrap();
        let recorder = Recorder {
            executed: AtomicUsize::new(0),
        };
        assert!(pool.execute(&TaskGraph::default(), &recorder).unwrap().is_empty());
    }

    #[test]
    fn test_shared_pool_is_reused() {
        let a = WorkerPool::shared().unwrap();
        let b = WorkerPool::shared().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.num_threads() >= 1);
    }
}
