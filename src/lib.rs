// ABOUTME: Main library module for the headway workflow execution core
// ABOUTME: Exports all core modules and provides the public API

pub mod cache;
pub mod cli;
pub mod executor;
pub mod processor;
pub mod script;
pub mod session;
pub mod task;
pub mod trace;

// Re-export commonly used types
pub use cache::{Cache, CacheEntry, CacheWriter, TraceRecord, TraceValue};
pub use cli::{App, Args};
pub use executor::{Executor, TaskHandle, TaskMonitor, TaskState};
pub use processor::{ProcessConfig, TaskProcessor};
pub use session::{HistoryFile, Session, SessionBuilder};
pub use task::{TaskConfig, TaskContext, TaskHash, TaskRun, Value};
pub use trace::TraceObserver;

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
