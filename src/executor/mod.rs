// ABOUTME: Pluggable task executors: local process and batch schedulers
// ABOUTME: Defines the executor seam, the shared status model and the name-based factory

pub mod error;
pub mod grid;
pub mod k8s;
pub mod local;
pub mod lsf;
pub mod monitor;
pub mod pbs;
pub mod sge;
pub mod slurm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::task::TaskRun;

pub use error::{ExecutorError, Result};
pub use grid::{GridExecutor, GridScheduler, QueueStatus};
pub use k8s::KubeScheduler;
pub use local::LocalExecutor;
pub use lsf::LsfScheduler;
pub use monitor::TaskMonitor;
pub use pbs::PbsScheduler;
pub use sge::SgeScheduler;
pub use slurm::SlurmScheduler;

/// Coarse lifecycle of a submitted task as seen through `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Submitted,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Identity-only handle to a submitted task. The executor never owns the
/// `TaskRun`; the owning processor resolves it back through the task id.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: u64,
    pub task_name: String,
    /// Native identifier: the OS pid or the scheduler job id.
    pub native_id: String,
    pub work_dir: PathBuf,
}

/// The executor seam: submit, poll, kill, plus shutdown semantics used by
/// the session abort path (refuse new submissions, kill in-flight work).
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Directive header block to embed in the task run script, if the
    /// backend consumes one.
    fn task_headers(&self, _task: &TaskRun) -> Option<String> {
        None
    }

    /// How often the monitor should poll this backend.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn submit(&self, task: &TaskRun) -> Result<TaskHandle>;

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState>;

    async fn kill(&self, handle: &TaskHandle) -> Result<()>;

    /// Refuse further submissions and kill everything in flight.
    async fn shutdown(&self);
}

/// Resolve an `executor` directive value to a backend.
pub fn create(name: &str) -> Result<Arc<dyn Executor>> {
    match name.to_ascii_lowercase().as_str() {
        "local" => Ok(Arc::new(LocalExecutor::new())),
        "slurm" => Ok(Arc::new(GridExecutor::new(SlurmScheduler))),
        "sge" => Ok(Arc::new(GridExecutor::new(SgeScheduler))),
        "pbs" => Ok(Arc::new(GridExecutor::new(PbsScheduler))),
        "lsf" => Ok(Arc::new(GridExecutor::new(LsfScheduler))),
        "k8s" => Ok(Arc::new(GridExecutor::new(KubeScheduler::default()))),
        other => Err(ExecutorError::UnknownExecutor(other.to_string())),
    }
}

/// Scheduler job names carry this prefix ahead of the sanitized task name.
pub const JOB_NAME_PREFIX: &str = "nf-";

/// Sanitize a task name for scheduler job names: every run of characters
/// outside `[0-9A-Za-z]` collapses to a single underscore.
pub fn job_name(task_name: &str) -> String {
    let mut out = String::from(JOB_NAME_PREFIX);
    let mut last_was_sep = false;
    for c in task_name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}
