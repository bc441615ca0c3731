// ABOUTME: Background monitor polling submitted tasks for completion
// ABOUTME: Resolves a per-task completion channel back to the owning processor

use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Executor, TaskHandle, TaskState};

struct Watched {
    handle: TaskHandle,
    notify: oneshot::Sender<TaskState>,
}

/// Polls the executor backend on its preferred interval and completes the
/// per-task channel once a watched task reaches a terminal state.
pub struct TaskMonitor {
    executor: Arc<dyn Executor>,
    active: Arc<Mutex<Vec<Watched>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TaskMonitor {
    pub fn spawn(executor: Arc<dyn Executor>) -> Arc<Self> {
        let active: Arc<Mutex<Vec<Watched>>> = Arc::new(Mutex::new(Vec::new()));
        let interval = executor.poll_interval();

        let loop_executor = Arc::clone(&executor);
        let loop_active = Arc::clone(&active);
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut guard = loop_active.lock().await;
                if guard.is_empty() {
                    continue;
                }
                let mut pending = Vec::with_capacity(guard.len());
                for watched in guard.drain(..) {
                    match loop_executor.poll(&watched.handle).await {
                        Ok(state) if state.is_terminal() => {
                            debug!(
                                "Task {} reached {:?}",
                                watched.handle.task_name, state
                            );
                            let _ = watched.notify.send(state);
                        }
                        Ok(_) => pending.push(watched),
                        Err(e) => {
                            warn!(
                                "Polling task {} failed: {}",
                                watched.handle.task_name, e
                            );
                            let _ = watched.notify.send(TaskState::Failed);
                        }
                    }
                }
                *guard = pending;
            }
        });

        Arc::new(Self {
            executor,
            active,
            poller: Mutex::new(Some(poller)),
        })
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Watch a submitted task; the returned channel resolves with the
    /// terminal state.
    pub async fn watch(&self, handle: TaskHandle) -> oneshot::Receiver<TaskState> {
        let (tx, rx) = oneshot::channel();
        self.active.lock().await.push(Watched { handle, notify: tx });
        rx
    }

    /// Stop polling and shut the executor down (kills in-flight work).
    pub async fn stop(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }
        self.executor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalExecutor;
    use crate::script::TaskLauncher;
    use crate::task::{TaskBody, TaskRun};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_monitor_resolves_completion() {
        let dir = TempDir::new().unwrap();
        let executor: Arc<dyn Executor> = Arc::new(LocalExecutor::new());
        let monitor = TaskMonitor::spawn(Arc::clone(&executor));

        let mut task = TaskRun::new(1, "quick", 1, TaskBody::script("true"));
        let work = dir.path().join("00").join("11");
        TaskLauncher::new(&work, task.name(), "true").write().unwrap();
        task.work_dir = Some(work);

        let handle = executor.submit(&task).await.unwrap();
        let rx = monitor.watch(handle).await;

        let state = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("monitor timed out")
            .expect("channel closed");
        assert_eq!(state, TaskState::Completed);

        monitor.stop().await;
    }
}
