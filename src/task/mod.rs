// ABOUTME: Task data model for the execution core
// ABOUTME: Exposes task runs, configs, contexts and the content-addressed fingerprint

pub mod config;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod run;

pub use config::{CopyStrategy, ErrorStrategy, HashMode, MemoryUnit, TaskConfig, WallTime};
pub use context::{TaskContext, Value};
pub use error::{Result, TaskError};
pub use fingerprint::{FingerprintBuilder, TaskHash, HASH_LEN};
pub use run::{RunType, TaskBody, TaskRun, EXIT_UNKNOWN};
