// ABOUTME: Error types for cache store and index operations
// ABOUTME: Distinguishes missing-index, payload codec and IO failure domains

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache index not found: {0}")]
    MissingIndex(PathBuf),

    #[error("Cache opened read-only")]
    ReadOnly,

    #[error("Corrupt index record at offset {offset} in {path}")]
    CorruptIndex { path: PathBuf, offset: u64 },

    #[error("Failed to encode cache entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode cache entry for {hash}: {source}")]
    Decode {
        hash: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cache writer stopped")]
    WriterStopped,

    #[error("Task error: {0}")]
    Task(#[from] crate::task::TaskError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
