// ABOUTME: Content-addressed persistent store for cache entries
// ABOUTME: One file per fingerprint under db/, atomic writes via temp-file rename

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{CacheError, Result};
use super::trace::TraceRecord;
use crate::task::{TaskContext, TaskHash};

/// The persisted value of one cache entry: the trace record, the optional
/// serialized context, and the number of runs that reference the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub trace: TraceRecord,
    pub context: Option<TaskContext>,
    pub ref_count: i32,
}

/// File-backed KV store keyed by task fingerprint.
///
/// Entries live as individual JSON files named by the hex hash so the store
/// iterates in key order and deletion is a single unlink.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    read_only: bool,
}

impl CacheStore {
    /// Open read-write, creating the db directory if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            read_only: false,
        })
    }

    /// Open an existing db directory without write access.
    pub fn open_read_only(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(CacheError::MissingIndex(dir.to_path_buf()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            read_only: true,
        })
    }

    fn entry_path(&self, hash: &TaskHash) -> PathBuf {
        self.dir.join(hash.to_hex())
    }

    pub fn get(&self, hash: &TaskHash) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry = serde_json::from_slice(&bytes).map_err(|source| CacheError::Decode {
            hash: hash.to_hex(),
            source,
        })?;
        Ok(Some(entry))
    }

    /// Write an entry atomically: serialize into a temp file in the db
    /// directory, then rename over the final name.
    pub fn put(&self, hash: &TaskHash, entry: &CacheEntry) -> Result<()> {
        self.check_writable()?;
        let bytes = serde_json::to_vec(entry).map_err(CacheError::Encode)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::fs::write(tmp.path(), &bytes)?;
        tmp.persist(self.entry_path(hash))
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    /// Read-modify-write of the reference count. Returns the count after the
    /// update, or `None` when no entry exists. A count that reaches zero
    /// deletes the entry (decrement-then-test).
    pub fn update_ref_count(&self, hash: &TaskHash, delta: i32) -> Result<Option<i32>> {
        self.check_writable()?;
        let Some(mut entry) = self.get(hash)? else {
            debug!("No cache entry to update for {}", hash);
            return Ok(None);
        };
        entry.ref_count += delta;
        if entry.ref_count <= 0 {
            self.delete(hash)?;
            debug!("Cache entry {} dropped at ref count zero", hash);
            return Ok(Some(0));
        }
        self.put(hash, &entry)?;
        Ok(Some(entry.ref_count))
    }

    pub fn delete(&self, hash: &TaskHash) -> Result<()> {
        self.check_writable()?;
        match std::fs::remove_file(self.entry_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::trace::{fields, TraceValue};
    use tempfile::TempDir;

    fn sample_entry() -> CacheEntry {
        let mut trace = TraceRecord::new();
        trace.set(fields::PROCESS, TraceValue::from("align"));
        trace.set(fields::EXIT, TraceValue::Int(0));
        let mut context = TaskContext::new();
        context.set("reads", crate::task::Value::path("/data/r1.fq"));
        CacheEntry {
            trace,
            context: Some(context),
            ref_count: 1,
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let hash = TaskHash::from_bytes([9; 16]);
        let entry = sample_entry();

        store.put(&hash, &entry).unwrap();
        let loaded = store.get(&hash).unwrap().unwrap();
        assert_eq!(loaded, entry);
    }

    #[test]
    fn test_missing_entry_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        assert!(store.get(&TaskHash::from_bytes([1; 16])).unwrap().is_none());
    }

    #[test]
    fn test_ref_count_decrement_deletes_at_zero() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let hash = TaskHash::from_bytes([3; 16]);
        store.put(&hash, &sample_entry()).unwrap();

        assert_eq!(store.update_ref_count(&hash, 1).unwrap(), Some(2));
        assert_eq!(store.update_ref_count(&hash, -1).unwrap(), Some(1));
        assert_eq!(store.update_ref_count(&hash, -1).unwrap(), Some(0));
        assert!(store.get(&hash).unwrap().is_none());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        {
            let store = CacheStore::open(dir.path()).unwrap();
            store
                .put(&TaskHash::from_bytes([5; 16]), &sample_entry())
                .unwrap();
        }
        let store = CacheStore::open_read_only(dir.path()).unwrap();
        assert!(store
            .put(&TaskHash::from_bytes([5; 16]), &sample_entry())
            .is_err());
        assert!(store.get(&TaskHash::from_bytes([5; 16])).unwrap().is_some());
    }
}
