// ABOUTME: Shared base for batch scheduler executors
// ABOUTME: Renders directives, shells out submit/status/kill commands and maps status codes

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::error::{ExecutorError, Result};
use super::{Executor, TaskHandle, TaskState};
use crate::script::TaskPaths;
use crate::task::TaskRun;

/// Scheduler-reported job states, common across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Running,
    Done,
    Error,
    Hold,
}

impl From<QueueStatus> for TaskState {
    fn from(status: QueueStatus) -> Self {
        match status {
            QueueStatus::Pending | QueueStatus::Hold => TaskState::Submitted,
            QueueStatus::Running => TaskState::Running,
            QueueStatus::Done => TaskState::Completed,
            QueueStatus::Error => TaskState::Failed,
        }
    }
}

/// The per-scheduler wire contract: directive rendering, submit command and
/// job-id extraction, queue listing and its status-code map, and the kill
/// command.
pub trait GridScheduler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// The comment token opening each directive line, e.g. `#SBATCH`.
    fn directive_token(&self) -> &'static str;

    /// Complete header lines for the task run script.
    fn render_directives(&self, task: &TaskRun) -> Vec<String>;

    /// Hook run before the submit command; Kubernetes writes its manifest
    /// here.
    fn prepare_submit(&self, _task: &TaskRun, _paths: &TaskPaths) -> Result<()> {
        Ok(())
    }

    /// Submit command argv, executed inside the task work dir.
    fn submit_command(&self, task: &TaskRun, paths: &TaskPaths) -> Vec<String>;

    /// Extract the native job id from the submit command stdout.
    fn parse_job_id(&self, stdout: &str) -> Result<String>;

    /// Queue listing argv; `user` is the `$USER` filter value when set.
    fn queue_status_command(&self, queue: Option<&str>, user: Option<&str>) -> Vec<String>;

    /// Parse the queue listing into `job id → status`.
    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus>;

    fn kill_command(&self, job_id: &str) -> Vec<String>;
}

const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Generic executor over a [`GridScheduler`].
pub struct GridExecutor<S: GridScheduler> {
    scheduler: S,
    accepting: AtomicBool,
    active: Mutex<HashMap<u64, String>>,
    poll_interval: std::time::Duration,
}

impl<S: GridScheduler> GridExecutor<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            accepting: AtomicBool::new(true),
            active: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override how often the monitor polls the queue status command.
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    async fn queue_status(&self, queue: Option<&str>) -> Result<HashMap<String, QueueStatus>> {
        let user = std::env::var("USER").ok();
        let argv = self
            .scheduler
            .queue_status_command(queue, user.as_deref());
        let output = run_command(&argv, None).await?;
        if output.exit != 0 {
            return Err(ExecutorError::QueueStatusFailed {
                exit: output.exit,
                stderr: output.stderr,
            });
        }
        Ok(self.scheduler.parse_queue_status(&output.stdout))
    }
}

#[async_trait]
impl<S: GridScheduler> Executor for GridExecutor<S> {
    fn name(&self) -> &'static str {
        self.scheduler.name()
    }

    fn task_headers(&self, task: &TaskRun) -> Option<String> {
        let lines = self.scheduler.render_directives(task);
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    fn poll_interval(&self) -> std::time::Duration {
        self.poll_interval
    }

    async fn submit(&self, task: &TaskRun) -> Result<TaskHandle> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ExecutorError::Rejected(task.id));
        }
        let work_dir = task
            .work_dir()
            .ok_or(ExecutorError::NoWorkDir(task.id))?
            .to_path_buf();
        let paths = TaskPaths::new(&work_dir);

        self.scheduler.prepare_submit(task, &paths)?;

        let argv = self.scheduler.submit_command(task, &paths);
        let output = run_command(&argv, Some(&work_dir)).await?;
        if output.exit != 0 {
            return Err(ExecutorError::SubmitFailed {
                exit: output.exit,
                stderr: output.stderr,
            });
        }

        let native_id = self.scheduler.parse_job_id(&output.stdout)?;
        debug!(
            "Task {} submitted to {} as job {}",
            task.name(),
            self.scheduler.name(),
            native_id
        );
        self.active.lock().await.insert(task.id, native_id.clone());

        Ok(TaskHandle {
            task_id: task.id,
            task_name: task.name(),
            native_id,
            work_dir,
        })
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState> {
        let statuses = self.queue_status(None).await?;
        match statuses.get(&handle.native_id) {
            Some(status) => {
                trace!("Job {} is {:?}", handle.native_id, status);
                Ok(TaskState::from(*status))
            }
            // Absent from the queue: the scheduler has forgotten the job,
            // treat it as done and let output collection decide the outcome.
            None => {
                self.active.lock().await.remove(&handle.task_id);
                Ok(TaskState::Completed)
            }
        }
    }

    async fn kill(&self, handle: &TaskHandle) -> Result<()> {
        let argv = self.scheduler.kill_command(&handle.native_id);
        let output = run_command(&argv, None).await?;
        if output.exit != 0 {
            warn!(
                "Kill command for job {} exited {}: {}",
                handle.native_id, output.exit, output.stderr
            );
        }
        self.active.lock().await.remove(&handle.task_id);
        Ok(())
    }

    async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let jobs: Vec<String> = self.active.lock().await.drain().map(|(_, id)| id).collect();
        for job_id in jobs {
            let argv = self.scheduler.kill_command(&job_id);
            if let Err(e) = run_command(&argv, None).await {
                warn!("Failed to kill job {} on shutdown: {}", job_id, e);
            }
        }
    }
}

pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: i32,
}

pub(crate) async fn run_command(argv: &[String], cwd: Option<&Path>) -> Result<CommandOutput> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd.output().await?;
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit: output.status.code().unwrap_or(-1),
    })
}
