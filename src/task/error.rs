// ABOUTME: Error types for the task data model
// ABOUTME: Covers directive parsing, context serialization, and hash decoding failures

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid memory unit: '{0}'")]
    InvalidMemoryUnit(String),

    #[error("Invalid duration: '{0}'")]
    InvalidDuration(String),

    #[error("Invalid error strategy: '{0}'")]
    InvalidErrorStrategy(String),

    #[error("Invalid hash mode: '{0}'")]
    InvalidHashMode(String),

    #[error("Invalid task hash: '{0}'")]
    InvalidHash(String),

    #[error("Failed to serialize task context: {0}")]
    ContextSerialize(#[source] serde_json::Error),

    #[error("Failed to deserialize task context: {0}")]
    ContextDeserialize(#[source] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
