// ABOUTME: Error types for session and history operations
// ABOUTME: Covers history lookup ambiguity, lock contention and cache propagation

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Ambiguous session id prefix '{prefix}' matches: {}", ids.join(", "))]
    AmbiguousId { prefix: String, ids: Vec<String> },

    #[error("No run found for '{0}'")]
    UnknownRun(String),

    #[error("History file not found: {0}")]
    MissingHistory(std::path::PathBuf),

    #[error("Run name '{0}' already used in history")]
    DuplicateRunName(String),

    #[error("Could not acquire lock on {0}")]
    LockTimeout(std::path::PathBuf),

    #[error("Session aborted: {0}")]
    Aborted(String),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
