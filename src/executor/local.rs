// ABOUTME: Local process executor
// ABOUTME: Forks the task run script on the host OS and tracks child completion

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::{ExecutorError, Result};
use super::{Executor, TaskHandle, TaskState};
use crate::script::TaskPaths;
use crate::task::TaskRun;

enum ChildState {
    Running(Child),
    Exited(i32),
}

/// Runs `.command.run` under the host OS. Stdout and stderr are captured by
/// the run script itself, so the child is spawned with null stdio.
pub struct LocalExecutor {
    accepting: AtomicBool,
    children: Mutex<HashMap<u64, ChildState>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(50)
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

        let child = Command::new("bash")
            .arg(paths.run_script())
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let native_id = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "?".to_string());
        debug!("Task {} forked as pid {}", task.name(), native_id);

        self.children
            .lock()
            .await
            .insert(task.id, ChildState::Running(child));

        Ok(TaskHandle {
            task_id: task.id,
            task_name: task.name(),
            native_id,
            work_dir,
        })
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState> {
        let mut children = self.children.lock().await;
        let state = children
            .get_mut(&handle.task_id)
            .ok_or(ExecutorError::UnknownHandle(handle.task_id))?;

        match state {
            ChildState::Exited(_) => Ok(TaskState::Completed),
            ChildState::Running(child) => match child.try_wait()? {
                Some(status) => {
                    let code = status.code().unwrap_or(-1);
                    *state = ChildState::Exited(code);
                    Ok(TaskState::Completed)
                }
                None => Ok(TaskState::Running),
            },
        }
    }

    async fn kill(&self, handle: &TaskHandle) -> Result<()> {
        let mut children = self.children.lock().await;
        if let Some(ChildState::Running(child)) = children.get_mut(&handle.task_id) {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill pid {}: {}", handle.native_id, e);
            }
        }
        children.remove(&handle.task_id);
        Ok(())
    }

    async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let mut children = self.children.lock().await;
        for (task_id, state) in children.iter_mut() {
            if let ChildState::Running(child) = state {
                debug!("Killing task {} on shutdown", task_id);
                let _ = child.kill().await;
            }
        }
        children.clear();
    }
}
