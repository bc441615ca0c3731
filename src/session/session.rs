// ABOUTME: Process-wide run state and lifecycle barrier
// ABOUTME: Owns the session id, work dir, open cache, processor registry and abort flow

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{Result, SessionError};
use super::history::HistoryFile;
use super::namegen;
use crate::cache::{Cache, CacheWriter};

/// Shutdown grace period granted to processors after an abort.
pub const ABORT_GRACE: Duration = Duration::from_secs(30);

/// Message carried by a processor's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Allow (another) binding round; used to pre-seed forwarding operators.
    Proceed,
    /// Drain in-flight work and reach terminal state.
    Poison,
}

/// The registered face of a processor: identity plus its control sender.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    pub id: u32,
    pub name: String,
    pub control: mpsc::Sender<ControlSignal>,
}

/// The first task fault recorded for a run.
#[derive(Debug, Clone)]
pub struct RunFault {
    pub process: String,
    pub task_name: String,
    pub report: String,
}

/// Builder for [`Session`]; every path the source reached through global
/// singletons is an explicit parameter here.
#[derive(Debug)]
pub struct SessionBuilder {
    base_dir: PathBuf,
    work_dir: Option<PathBuf>,
    run_name: Option<String>,
    resume_id: Option<Uuid>,
    cacheable: bool,
}

impl SessionBuilder {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            work_dir: None,
            run_name: None,
            resume_id: None,
            cacheable: true,
        }
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    /// Resume a previous session: the id stays stable across attempts.
    pub fn resume(mut self, session_id: Uuid) -> Self {
        self.resume_id = Some(session_id);
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Allocate the session id, record the run in history and open the
    /// cache in write mode together with its per-run index.
    pub async fn start(self, command_line: impl Into<String>) -> Result<Arc<Session>> {
        let command_line = command_line.into();
        let history = HistoryFile::new(&self.base_dir);
        let resume_mode = self.resume_id.is_some();
        let session_id = self.resume_id.unwrap_or_else(Uuid::new_v4);

        let run_name = match self.run_name {
            Some(name) => {
                if !history.find_by_name(&name)?.is_empty() {
                    return Err(SessionError::DuplicateRunName(name));
                }
                name
            }
            None => namegen::unique_name(&history)?,
        };

        let work_dir = self
            .work_dir
            .unwrap_or_else(|| self.base_dir.join("work"));
        std::fs::create_dir_all(&work_dir)?;

        history.append(&session_id.to_string(), &run_name, &command_line)?;
        let cache = Arc::new(Cache::open(&self.base_dir, session_id, &run_name)?);
        let (writer, writer_handle) = CacheWriter::spawn(Arc::clone(&cache));

        info!(
            "Session started: {} (run name: {}, resume: {})",
            session_id, run_name, resume_mode
        );

        Ok(Arc::new(Session {
            session_id,
            run_name,
            base_dir: self.base_dir,
            work_dir,
            command_line,
            resume_mode,
            cacheable: self.cacheable,
            aborted: AtomicBool::new(false),
            history,
            cache,
            writer: Mutex::new(Some(writer)),
            writer_handle: Mutex::new(Some(writer_handle)),
            processors: RwLock::new(HashMap::new()),
            next_processor_id: AtomicU32::new(1),
            running: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            terminated: AtomicUsize::new(0),
            quiescent: Notify::new(),
            first_fault: Mutex::new(None),
            work_dir_lock: tokio::sync::Mutex::new(()),
        }))
    }
}

/// Process-wide singleton state of one run.
#[derive(Debug)]
pub struct Session {
    session_id: Uuid,
    run_name: String,
    base_dir: PathBuf,
    work_dir: PathBuf,
    command_line: String,
    resume_mode: bool,
    cacheable: bool,
    aborted: AtomicBool,
    history: HistoryFile,
    cache: Arc<Cache>,
    writer: Mutex<Option<CacheWriter>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    processors: RwLock<HashMap<u32, ProcessorHandle>>,
    next_processor_id: AtomicU32,
    running: AtomicUsize,
    created: AtomicUsize,
    terminated: AtomicUsize,
    quiescent: Notify,
    first_fault: Mutex<Option<RunFault>>,
    work_dir_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Cache namespace; identical to the session id.
    pub fn unique_id(&self) -> Uuid {
        self.session_id
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn resume_mode(&self) -> bool {
        self.resume_mode
    }

    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> &HistoryFile {
        &self.history
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Handle to the single-writer cache agent.
    pub fn cache_writer(&self) -> Option<CacheWriter> {
        self.writer.lock().expect("writer poisoned").clone()
    }

    /// Process-wide lock guarding work-dir creation during collision
    /// resolution.
    pub fn work_dir_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.work_dir_lock
    }

    /// Register a processor and return its session-monotonic id.
    pub async fn register_processor(
        &self,
        name: &str,
        control: mpsc::Sender<ControlSignal>,
    ) -> u32 {
        let id = self.next_processor_id.fetch_add(1, Ordering::SeqCst);
        let handle = ProcessorHandle {
            id,
            name: name.to_string(),
            control,
        };
        self.processors.write().await.insert(id, handle);
        self.running.fetch_add(1, Ordering::SeqCst);
        debug!("Processor registered: {} (id: {})", name, id);
        id
    }

    pub async fn deregister_processor(&self, id: u32) {
        if self.processors.write().await.remove(&id).is_some() {
            let remaining = self.running.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!("Processor deregistered: {} ({} still running)", id, remaining);
            if remaining == 0 {
                self.quiescent.notify_waiters();
            }
        }
    }

    pub async fn processor(&self, id: u32) -> Option<ProcessorHandle> {
        self.processors.read().await.get(&id).cloned()
    }

    pub fn notify_process_create(&self) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn notify_process_terminate(&self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn processes_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn processes_terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Block until every registered processor has reached terminal state.
    pub async fn await_termination(&self) {
        loop {
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.quiescent.notified();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Raise the aborted flag and poison every control channel. Does not
    /// wait; callers inside a processor would deadlock on themselves.
    async fn raise_abort(&self, reason: &str) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Session aborted: {}", reason);

        let handles: Vec<ProcessorHandle> =
            self.processors.read().await.values().cloned().collect();
        for handle in handles {
            if handle.control.send(ControlSignal::Poison).await.is_err() {
                debug!("Processor {} control channel already closed", handle.id);
            }
        }
    }

    /// Abort the run: raise the flag, poison every control channel and wait
    /// for quiescence within the grace period.
    pub async fn abort(&self, reason: &str) {
        self.raise_abort(reason).await;

        if tokio::time::timeout(ABORT_GRACE, self.await_termination())
            .await
            .is_err()
        {
            warn!(
                "Processors still running after {:?} grace period",
                ABORT_GRACE
            );
        }
    }

    /// Record the first task fault and initiate the abort sequence.
    pub async fn fault(&self, fault: RunFault) {
        let is_first = {
            let mut slot = self.first_fault.lock().expect("fault slot poisoned");
            if slot.is_none() {
                *slot = Some(fault.clone());
                true
            } else {
                false
            }
        };
        if is_first {
            error!("{}", fault.report);
        } else {
            error!(
                "Task {} failed (process {})",
                fault.task_name, fault.process
            );
        }
        self.raise_abort(&format!("task '{}' failed", fault.task_name))
            .await;
    }

    pub fn first_fault(&self) -> Option<RunFault> {
        self.first_fault.lock().expect("fault slot poisoned").clone()
    }

    /// Stop the cache writer and wait for queued operations to drain.
    pub async fn shutdown(&self) {
        let writer = self.writer.lock().expect("writer poisoned").take();
        drop(writer);
        let handle = self
            .writer_handle
            .lock()
            .expect("writer handle poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Cache writer join failed: {}", e);
            }
        }
        info!("Session {} shut down", self.session_id);
    }
}
