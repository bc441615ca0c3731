// ABOUTME: Trace record model for completed task attempts
// ABOUTME: An ordered metric map that round-trips through the cache store field-for-field

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::task::run::EXIT_UNKNOWN;
use crate::task::TaskRun;

/// A single trace metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for TraceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceValue::Bool(b) => write!(f, "{}", b),
            TraceValue::Int(i) => write!(f, "{}", i),
            TraceValue::Float(x) => write!(f, "{}", x),
            TraceValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for TraceValue {
    fn from(s: &str) -> Self {
        TraceValue::Str(s.to_string())
    }
}

impl From<String> for TraceValue {
    fn from(s: String) -> Self {
        TraceValue::Str(s)
    }
}

impl From<i64> for TraceValue {
    fn from(i: i64) -> Self {
        TraceValue::Int(i)
    }
}

/// Metric names with a defined meaning. Anything else (e.g. parsed resource
/// metrics like `%cpu`, `vmem`, `rss`) rides along as free-form entries.
pub mod fields {
    pub const TASK_ID: &str = "task_id";
    pub const HASH: &str = "hash";
    pub const NATIVE_ID: &str = "native_id";
    pub const PROCESS: &str = "process";
    pub const NAME: &str = "name";
    pub const STATUS: &str = "status";
    pub const EXIT: &str = "exit";
    pub const SUBMIT: &str = "submit";
    pub const START: &str = "start";
    pub const COMPLETE: &str = "complete";
    pub const REALTIME: &str = "realtime";
    pub const ATTEMPT: &str = "attempt";
    pub const FOLDER: &str = "folder";
    pub const CACHED: &str = "cached";
    pub const CPU_PERCENT: &str = "%cpu";
    pub const VMEM: &str = "vmem";
    pub const RSS: &str = "rss";
}

/// The per-task trace: an ordered mapping of metric names to typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    values: IndexMap<String, TraceValue>,
}

impl TraceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the identity fields of a task at submission time.
    pub fn from_task(task: &TaskRun) -> Self {
        let mut record = Self::new();
        record.set(fields::TASK_ID, TraceValue::Int(task.id as i64));
        if let Some(hash) = task.hash {
            record.set(fields::HASH, TraceValue::Str(hash.to_hex()));
        }
        record.set(fields::PROCESS, TraceValue::Str(task.process_name.clone()));
        record.set(fields::NAME, TraceValue::Str(task.name()));
        record.set(fields::ATTEMPT, TraceValue::Int(task.config.attempt as i64));
        if let Some(dir) = task.work_dir() {
            record.set(
                fields::FOLDER,
                TraceValue::Str(dir.display().to_string()),
            );
        }
        record
    }

    pub fn get(&self, name: &str) -> Option<&TraceValue> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: TraceValue) {
        self.values.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TraceValue)> {
        self.values.iter()
    }

    /// Rendered field value, `-` when absent. This is what the `log`
    /// command prints for `-f` field lists.
    pub fn field(&self, name: &str) -> String {
        self.get(name)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn set_status(&mut self, status: &str) {
        self.set(fields::STATUS, TraceValue::from(status));
    }

    pub fn set_exit(&mut self, exit: i32) {
        if exit != EXIT_UNKNOWN {
            self.set(fields::EXIT, TraceValue::Int(exit as i64));
        }
    }

    pub fn set_submit(&mut self, at: DateTime<Utc>) {
        self.set(fields::SUBMIT, TraceValue::Int(at.timestamp_millis()));
    }

    pub fn set_start(&mut self, at: DateTime<Utc>) {
        self.set(fields::START, TraceValue::Int(at.timestamp_millis()));
    }

    /// Record completion and derive `realtime` from the start timestamp.
    pub fn set_complete(&mut self, at: DateTime<Utc>) {
        let complete = at.timestamp_millis();
        self.set(fields::COMPLETE, TraceValue::Int(complete));
        if let Some(TraceValue::Int(start)) = self.get(fields::START) {
            let elapsed = complete - *start;
            self.set(fields::REALTIME, TraceValue::Int(elapsed.max(0)));
        }
    }

    pub fn exit(&self) -> Option<i64> {
        match self.get(fields::EXIT) {
            Some(TraceValue::Int(code)) => Some(*code),
            _ => None,
        }
    }

    pub fn folder(&self) -> Option<&str> {
        match self.get(fields::FOLDER) {
            Some(TraceValue::Str(path)) => Some(path),
            _ => None,
        }
    }
}
