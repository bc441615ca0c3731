// ABOUTME: Error types for executor submission, polling and kill operations
// ABOUTME: Separates scheduler wire failures from local process failures

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Unknown executor: '{0}'")]
    UnknownExecutor(String),

    #[error("Executor is shut down, refusing submission of task {0}")]
    Rejected(u64),

    #[error("Task {0} has no work directory assigned")]
    NoWorkDir(u64),

    #[error("Submit command failed (exit {exit}): {stderr}")]
    SubmitFailed { exit: i32, stderr: String },

    #[error("Could not parse job id from scheduler output: '{0}'")]
    JobIdParse(String),

    #[error("Queue status command failed (exit {exit}): {stderr}")]
    QueueStatusFailed { exit: i32, stderr: String },

    #[error("Unknown task handle: {0}")]
    UnknownHandle(u64),

    #[error("Failed to render job manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
