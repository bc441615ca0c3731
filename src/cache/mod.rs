// ABOUTME: Persistent cache of completed task attempts keyed by fingerprint
// ABOUTME: Combines the KV store, the per-run index and the single-writer agent

pub mod error;
pub mod index;
pub mod store;
pub mod trace;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::task::{TaskContext, TaskHash};

pub use error::{CacheError, Result};
pub use index::{IndexReader, IndexRecord, IndexWriter, RECORD_LEN};
pub use store::{CacheEntry, CacheStore};
pub use trace::{TraceRecord, TraceValue};

pub const CACHE_DIR_NAME: &str = ".cache";
pub const DB_DIR_NAME: &str = "db";

/// `<base>/.cache/<sessionId>` — the per-session cache directory.
pub fn session_cache_dir(base_dir: &Path, session_id: &Uuid) -> PathBuf {
    base_dir.join(CACHE_DIR_NAME).join(session_id.to_string())
}

/// The cache for one `(session, run)` pair.
///
/// Layout below `<base>/.cache/<sessionId>`: `db/` holds one entry per task
/// fingerprint, `index.<runName>` is the append-only binding-order index.
#[derive(Debug)]
pub struct Cache {
    session_id: Uuid,
    run_name: String,
    dir: PathBuf,
    store: CacheStore,
    index_writer: Option<Mutex<IndexWriter>>,
}

impl Cache {
    /// Open read-write for an executing run: (re)creates `index.<runName>`
    /// and the db directory.
    pub fn open(base_dir: &Path, session_id: Uuid, run_name: &str) -> Result<Self> {
        let dir = session_cache_dir(base_dir, &session_id);
        let store = CacheStore::open(&dir.join(DB_DIR_NAME))?;
        let index_writer = IndexWriter::create(&dir.join(format!("index.{}", run_name)))?;
        Ok(Self {
            session_id,
            run_name: run_name.to_string(),
            dir,
            store,
            index_writer: Some(Mutex::new(index_writer)),
        })
    }

    /// Open for inspection: the run's index file must already exist and the
    /// store is read-only.
    pub fn open_for_read(base_dir: &Path, session_id: Uuid, run_name: &str) -> Result<Self> {
        let dir = session_cache_dir(base_dir, &session_id);
        let index_path = dir.join(format!("index.{}", run_name));
        if !index_path.is_file() {
            return Err(CacheError::MissingIndex(index_path));
        }
        let store = CacheStore::open_read_only(&dir.join(DB_DIR_NAME))?;
        Ok(Self {
            session_id,
            run_name: run_name.to_string(),
            dir,
            store,
            index_writer: None,
        })
    }

    /// Open for entry deletion: the existing index is required and left
    /// untouched, the store is writable.
    pub fn open_for_modify(base_dir: &Path, session_id: Uuid, run_name: &str) -> Result<Self> {
        let dir = session_cache_dir(base_dir, &session_id);
        let index_path = dir.join(format!("index.{}", run_name));
        if !index_path.is_file() {
            return Err(CacheError::MissingIndex(index_path));
        }
        let store = CacheStore::open(&dir.join(DB_DIR_NAME))?;
        Ok(Self {
            session_id,
            run_name: run_name.to_string(),
            dir,
            store,
            index_writer: None,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("index.{}", self.run_name))
    }

    pub fn get_entry(&self, hash: &TaskHash) -> Result<Option<CacheEntry>> {
        self.store.get(hash)
    }

    /// Store a fresh entry with a reference count of one.
    pub fn put_entry(
        &self,
        hash: &TaskHash,
        trace: TraceRecord,
        context: Option<TaskContext>,
    ) -> Result<()> {
        self.store.put(
            hash,
            &CacheEntry {
                trace,
                context,
                ref_count: 1,
            },
        )
    }

    pub fn inc_entry(&self, hash: &TaskHash) -> Result<Option<i32>> {
        self.store.update_ref_count(hash, 1)
    }

    /// Decrement-then-test: the entry is removed when the updated count
    /// reaches zero.
    pub fn dec_entry(&self, hash: &TaskHash) -> Result<Option<i32>> {
        self.store.update_ref_count(hash, -1)
    }

    pub fn write_index(&self, hash: &TaskHash, cached: bool) -> Result<()> {
        let writer = self.index_writer.as_ref().ok_or(CacheError::ReadOnly)?;
        let mut guard = writer.lock().expect("index writer poisoned");
        guard.append(hash, cached)
    }

    /// Iterate the run's index in binding order, resolving each record's db
    /// payload. Records whose payload has gone missing (stale index) are
    /// skipped with a debug log. Returns the number of records visited.
    pub fn each_record<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&TaskHash, &CacheEntry, bool),
    {
        let reader = IndexReader::open(&self.index_path())?;
        let mut visited = 0;
        for record in reader.records()? {
            match self.store.get(&record.hash)? {
                Some(entry) => {
                    f(&record.hash, &entry, record.cached);
                    visited += 1;
                }
                None => {
                    debug!("Skipping stale index record {}", record.hash);
                }
            }
        }
        Ok(visited)
    }

    /// Remove this run's index file.
    pub fn drop_index(&self) -> Result<()> {
        match std::fs::remove_file(self.index_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the entire per-session cache directory.
    pub fn drop_all(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One operation accepted by the cache writer agent.
#[derive(Debug)]
pub enum WriteOp {
    Put {
        hash: TaskHash,
        trace: TraceRecord,
        context: Option<TaskContext>,
    },
    Inc(TaskHash),
    Dec(TaskHash),
    Index {
        hash: TaskHash,
        cached: bool,
    },
}

/// Async writer agent serializing every cache mutation issued off the
/// processor threads. Operations apply strictly in send order, which is what
/// keeps index records in binding order even when tasks complete out of
/// order.
#[derive(Debug, Clone)]
pub struct CacheWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl CacheWriter {
    pub fn spawn(cache: std::sync::Arc<Cache>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match op {
                    WriteOp::Put {
                        hash,
                        trace,
                        context,
                    } => cache.put_entry(&hash, trace, context),
                    WriteOp::Inc(hash) => cache.inc_entry(&hash).map(|_| ()),
                    WriteOp::Dec(hash) => cache.dec_entry(&hash).map(|_| ()),
                    WriteOp::Index { hash, cached } => cache.write_index(&hash, cached),
                };
                if let Err(e) = result {
                    warn!("Cache write failed: {}", e);
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn put(
        &self,
        hash: TaskHash,
        trace: TraceRecord,
        context: Option<TaskContext>,
    ) -> Result<()> {
        self.send(WriteOp::Put {
            hash,
            trace,
            context,
        })
    }

    pub fn inc(&self, hash: TaskHash) -> Result<()> {
        self.send(WriteOp::Inc(hash))
    }

    pub fn dec(&self, hash: TaskHash) -> Result<()> {
        self.send(WriteOp::Dec(hash))
    }

    pub fn index(&self, hash: TaskHash, cached: bool) -> Result<()> {
        self.send(WriteOp::Index { hash, cached })
    }

    fn send(&self, op: WriteOp) -> Result<()> {
        self.tx.send(op).map_err(|_| CacheError::WriterStopped)
    }
}
