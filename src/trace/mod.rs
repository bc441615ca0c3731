// ABOUTME: Lifecycle event observers for processes and task attempts
// ABOUTME: Provides the observer seam plus the per-run trace file sink

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::cache::trace::fields;
use crate::cache::TraceRecord;

/// Sink for lifecycle events emitted by processors.
#[async_trait]
pub trait TraceObserver: Send + Sync {
    async fn on_process_create(&self, _name: &str) {}
    async fn on_process_terminate(&self, _name: &str) {}
    async fn on_task_submit(&self, _trace: &TraceRecord) {}
    async fn on_task_complete(&self, _trace: &TraceRecord) {}
    async fn on_task_cached(&self, _trace: &TraceRecord) {}
}

/// Columns written to the run trace file, in order.
const TRACE_FILE_FIELDS: &[&str] = &[
    fields::TASK_ID,
    fields::HASH,
    fields::NAME,
    fields::PROCESS,
    fields::STATUS,
    fields::EXIT,
    fields::SUBMIT,
    fields::START,
    fields::COMPLETE,
    fields::REALTIME,
    fields::ATTEMPT,
];

/// Tab-separated per-run trace log, one line per finished task.
pub struct TraceFileObserver {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl TraceFileObserver {
    pub fn new(base_dir: &Path, run_name: &str) -> Self {
        Self {
            path: base_dir.join(format!("trace-{}.txt", run_name)),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, trace: &TraceRecord) {
        use std::io::Write;

        let mut guard = self.file.lock().expect("trace file poisoned");
        if guard.is_none() {
            match std::fs::File::create(&self.path) {
                Ok(mut file) => {
                    let header = TRACE_FILE_FIELDS.join("\t");
                    if let Err(e) = writeln!(file, "{}", header) {
                        warn!("Cannot write trace header: {}", e);
                    }
                    *guard = Some(file);
                }
                Err(e) => {
                    warn!("Cannot create trace file {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            let line: Vec<String> = TRACE_FILE_FIELDS
                .iter()
                .map(|name| trace.field(name))
                .collect();
            if let Err(e) = writeln!(file, "{}", line.join("\t")) {
                warn!("Cannot append trace line: {}", e);
            }
        }
    }
}

#[async_trait]
impl TraceObserver for TraceFileObserver {
    async fn on_task_complete(&self, trace: &TraceRecord) {
        self.append(trace);
    }

    async fn on_task_cached(&self, trace: &TraceRecord) {
        self.append(trace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TraceValue;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_trace_file_lines() {
        let dir = TempDir::new().unwrap();
        let observer = TraceFileObserver::new(dir.path(), "steady_volta");

        let mut trace = TraceRecord::new();
        trace.set(fields::TASK_ID, TraceValue::Int(1));
        trace.set(fields::NAME, TraceValue::from("align (1)"));
        trace.set_status("COMPLETED");
        trace.set_exit(0);
        observer.on_task_complete(&trace).await;

        let content = std::fs::read_to_string(observer.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("task_id\thash\tname"));
        assert!(lines[1].contains("align (1)"));
        assert!(lines[1].contains("COMPLETED"));
    }
}
