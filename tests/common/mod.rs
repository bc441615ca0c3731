// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Seeds cached runs, counts executor submissions and wires simple pipelines

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use headway::cache::trace::fields;
use headway::cache::{Cache, TraceRecord, TraceValue};
use headway::executor::{Executor, LocalExecutor, Result as ExecResult, TaskHandle, TaskState};
use headway::session::HistoryFile;
use headway::task::{TaskHash, TaskRun};

/// One pre-baked cached task for CLI tests.
pub struct SeededTask {
    pub hash: TaskHash,
    pub folder: String,
    pub exit: i64,
}

impl SeededTask {
    pub fn new(seed: u8, folder: impl Into<String>, exit: i64) -> Self {
        Self {
            hash: TaskHash::from_bytes([seed; 16]),
            folder: folder.into(),
            exit,
        }
    }
}

/// Create a history entry plus a populated cache for a finished run.
pub fn seed_cached_run(
    base: &Path,
    session_id: Uuid,
    run_name: &str,
    tasks: &[SeededTask],
) -> Cache {
    let history = HistoryFile::new(base);
    history
        .append(&session_id.to_string(), run_name, "headway run pipeline")
        .unwrap();

    let cache = Cache::open(base, session_id, run_name).unwrap();
    for (i, task) in tasks.iter().enumerate() {
        let mut trace = TraceRecord::new();
        trace.set(fields::TASK_ID, TraceValue::Int(i as i64 + 1));
        trace.set(fields::PROCESS, TraceValue::from("proc"));
        trace.set(
            fields::NAME,
            TraceValue::Str(format!("proc ({})", i + 1)),
        );
        trace.set(fields::EXIT, TraceValue::Int(task.exit));
        trace.set(fields::FOLDER, TraceValue::Str(task.folder.clone()));
        cache.put_entry(&task.hash, trace, None).unwrap();
        cache.write_index(&task.hash, false).unwrap();
    }
    cache
}

/// Executor wrapper counting real submissions, used by the resume tests.
pub struct CountingExecutor {
    inner: LocalExecutor,
    submissions: AtomicUsize,
}

impl CountingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalExecutor::new(),
            submissions: AtomicUsize::new(0),
        })
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for CountingExecutor {
    fn name(&self) -> &'static str {
        "counting-local"
    }

    fn poll_interval(&self) -> std::time::Duration {
        self.inner.poll_interval()
    }

    async fn submit(&self, task: &TaskRun) -> ExecResult<TaskHandle> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.inner.submit(task).await
    }

    async fn poll(&self, handle: &TaskHandle) -> ExecResult<TaskState> {
        self.inner.poll(handle).await
    }

    async fn kill(&self, handle: &TaskHandle) -> ExecResult<()> {
        self.inner.kill(handle).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

/// Observer counting lifecycle events, used to assert resume behavior.
#[derive(Default)]
pub struct CollectingObserver {
    pub cached: AtomicUsize,
    pub completed: AtomicUsize,
}

#[async_trait]
impl headway::trace::TraceObserver for CollectingObserver {
    async fn on_task_complete(&self, _trace: &TraceRecord) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_task_cached(&self, _trace: &TraceRecord) {
        self.cached.fetch_add(1, Ordering::SeqCst);
    }
}

/// A scratch project directory with separate base and work dirs.
pub struct TestProject {
    pub dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn work(&self) -> std::path::PathBuf {
        self.dir.path().join("work")
    }
}
