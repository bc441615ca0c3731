// ABOUTME: The per-attempt task descriptor and its lifecycle mutators
// ABOUTME: Owns identity, binding, fingerprint, work dir and completion state of one attempt

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::config::TaskConfig;
use super::context::{TaskContext, Value};
use super::fingerprint::TaskHash;

/// Exit status sentinel meaning "not yet known".
pub const EXIT_UNKNOWN: i32 = i32::MAX;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Whether an attempt is the first submission or a retry of a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Submit,
    Retry,
}

/// The user-supplied body of a process.
#[derive(Debug, Clone)]
pub enum TaskBody {
    /// A shell script rendered into `.command.sh` and run by an executor.
    Script { source: String },
    /// A native value block evaluated in-process. The source text still
    /// participates in fingerprinting.
    Native {
        source: String,
        func: fn(&TaskContext) -> std::result::Result<Value, String>,
    },
}

impl TaskBody {
    pub fn script(source: impl Into<String>) -> Self {
        TaskBody::Script {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            TaskBody::Script { source } => source,
            TaskBody::Native { source, .. } => source,
        }
    }

    pub fn is_script(&self) -> bool {
        matches!(self, TaskBody::Script { .. })
    }
}

/// One task attempt.
///
/// Mutated only by its owning processor up to submission; after submission
/// only through the completion path driven by the executor monitor.
#[derive(Debug, Clone)]
pub struct TaskRun {
    /// Globally monotonic attempt id.
    pub id: u64,
    /// Per-processor binding index, shared between an attempt and its retries.
    pub index: u64,
    /// Owning processor id; the processor handle is resolved via the session.
    pub processor_id: u32,
    pub process_name: String,
    pub body: TaskBody,
    pub config: TaskConfig,
    pub context: TaskContext,
    pub inputs: IndexMap<String, Value>,
    pub outputs: IndexMap<String, Value>,
    pub hash: Option<TaskHash>,
    pub work_dir: Option<PathBuf>,
    pub exit_status: i32,
    pub fail_count: u32,
    pub cached: bool,
    pub failed: bool,
    pub aborted: bool,
    pub run_type: RunType,
    /// Rendered script after context interpolation; set at submit time.
    pub script: Option<String>,
}

impl TaskRun {
    pub fn new(processor_id: u32, process_name: impl Into<String>, index: u64, body: TaskBody) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst),
            index,
            processor_id,
            process_name: process_name.into(),
            body,
            config: TaskConfig::default(),
            context: TaskContext::new(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            hash: None,
            work_dir: None,
            exit_status: EXIT_UNKNOWN,
            fail_count: 0,
            cached: false,
            failed: false,
            aborted: false,
            run_type: RunType::Submit,
            script: None,
        }
    }

    /// Display name in the `process (index)` form used by logs and traces.
    /// An index of zero means the attempt is not bound yet and the bare
    /// process name is used.
    pub fn name(&self) -> String {
        if self.index == 0 {
            self.process_name.clone()
        } else {
            format!("{} ({})", self.process_name, self.index)
        }
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    /// Assign the fingerprint and derive the work dir below the session
    /// work root: `<root>/<hex[0..2]>/<hex[2..]>`.
    pub fn assign_hash(&mut self, hash: TaskHash, work_root: &Path) {
        self.work_dir = Some(work_root.join(hash.prefix()).join(hash.suffix()));
        self.hash = Some(hash);
    }

    pub fn mark_cached(&mut self) {
        self.cached = true;
        self.failed = false;
    }

    pub fn mark_complete(&mut self, exit_status: i32) {
        self.exit_status = exit_status;
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.fail_count += 1;
    }

    pub fn is_success(&self) -> bool {
        !self.failed
            && (!self.body.is_script() || self.config.is_valid_exit(self.exit_status))
    }

    /// Build the next attempt for a retry: same binding index, fresh id,
    /// `attempt` bumped, outputs and completion state reset.
    pub fn make_retry(&self) -> TaskRun {
        let mut next = TaskRun::new(
            self.processor_id,
            self.process_name.clone(),
            self.index,
            self.body.clone(),
        );
        next.config = self.config.clone();
        next.config.attempt = self.fail_count + 1;
        next.context = self.context.clone();
        next.inputs = self.inputs.clone();
        next.fail_count = self.fail_count;
        next.run_type = RunType::Retry;
        next
    }

    pub fn set_input(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.context.set(name.clone(), value.clone());
        self.inputs.insert(name, value);
    }

    pub fn set_output(&mut self, name: impl Into<String>, value: Value) {
        self.outputs.insert(name.into(), value);
    }
}
