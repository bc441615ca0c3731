// ABOUTME: The dataflow operator driving one process definition
// ABOUTME: Binds input tuples, fingerprints tasks, resumes from cache or submits to an executor

pub mod config;
pub mod error;
pub mod forward;
pub mod outputs;
pub mod staging;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cache::trace::fields;
use crate::cache::{TraceRecord, TraceValue};
use crate::executor::{TaskMonitor, TaskState as ExecState};
use crate::script::{StagedFile, TaskLauncher, TaskPaths};
use crate::session::{ControlSignal, RunFault, Session};
use crate::task::{
    FingerprintBuilder, RunType, TaskBody, TaskHash, TaskRun, Value, EXIT_UNKNOWN,
};
use crate::trace::TraceObserver;

pub use config::{
    default_max_forks, BindMode, FileType, InputDecl, InputKind, OutputDecl, OutputKind,
    ProcessConfig, WalkOptions, WhenGuard,
};
pub use error::{build_report, classify, ErrorAction, TaskFailure};
pub use staging::{normalize_file_input, StagingError};

const DATA_CHANNEL_CAPACITY: usize = 100;
const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Open a bounded data channel for wiring processors together.
pub fn data_channel() -> (mpsc::Sender<Value>, mpsc::Receiver<Value>) {
    mpsc::channel(DATA_CHANNEL_CAPACITY)
}

/// Progress counters of one processor.
#[derive(Debug, Default)]
pub struct ProcessorState {
    submitted: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    finished: AtomicBool,
}

impl ProcessorState {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn add_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// The multi-input operator owning one process definition and its task runs.
pub struct TaskProcessor {
    id: u32,
    config: ProcessConfig,
    body: TaskBody,
    session: Arc<Session>,
    monitor: Arc<TaskMonitor>,
    observers: Vec<Arc<dyn TraceObserver>>,
    outputs: std::sync::Mutex<Vec<mpsc::Sender<Value>>>,
    output_lock: tokio::sync::Mutex<()>,
    state: ProcessorState,
    next_index: AtomicU64,
}

impl TaskProcessor {
    /// Register with the session and start the operator loop. When the
    /// configuration declares *each* inputs, a forwarding operator is
    /// inserted ahead of the processor's internal queues.
    pub async fn spawn(
        config: ProcessConfig,
        body: TaskBody,
        session: Arc<Session>,
        monitor: Arc<TaskMonitor>,
        observers: Vec<Arc<dyn TraceObserver>>,
        inputs: Vec<mpsc::Receiver<Value>>,
        outputs: Vec<mpsc::Sender<Value>>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let id = session.register_processor(&config.name, control_tx).await;

        let inputs = if config.has_each_input() {
            let each_positions: Vec<usize> = config
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, decl)| decl.is_each())
                .map(|(i, _)| i)
                .collect();
            let mut internal_rx = Vec::with_capacity(inputs.len());
            let mut internal_tx = Vec::with_capacity(inputs.len());
            for _ in 0..inputs.len() {
                let (tx, rx) = data_channel();
                internal_tx.push(tx);
                internal_rx.push(rx);
            }
            let (_seed_tx, seed_rx) = forward::seeded_control();
            let _forwarder = forward::spawn_forwarder(inputs, each_positions, internal_tx, seed_rx);
            internal_rx
        } else {
            inputs
        };

        let processor = Arc::new(Self {
            id,
            config,
            body,
            session,
            monitor,
            observers,
            outputs: std::sync::Mutex::new(outputs),
            output_lock: tokio::sync::Mutex::new(()),
            state: ProcessorState::default(),
            next_index: AtomicU64::new(0),
        });

        let runner = Arc::clone(&processor);
        let handle = tokio::spawn(async move { runner.run(inputs, control_rx).await });
        (processor, handle)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    /// The operator loop: one tuple per binding, control channel checked
    /// with priority, bindings bounded by `max_forks`.
    async fn run(
        self: Arc<Self>,
        mut inputs: Vec<mpsc::Receiver<Value>>,
        mut control: mpsc::Receiver<ControlSignal>,
    ) {
        self.session.notify_process_create();
        for observer in &self.observers {
            observer.on_process_create(&self.config.name).await;
        }
        debug!("Processor {} ({}) started", self.config.name, self.id);

        let single_shot = self.config.is_single_shot() || self.config.inputs.is_empty();
        let semaphore = Arc::new(Semaphore::new(self.config.max_forks.max(1)));
        let mut bindings = JoinSet::new();

        loop {
            if self.state.is_finished() || self.session.is_aborted() {
                break;
            }

            let tuple = if inputs.is_empty() {
                Some(Vec::new())
            } else {
                let head = tokio::select! {
                    biased;
                    signal = control.recv() => {
                        match signal {
                            Some(ControlSignal::Proceed) => continue,
                            Some(ControlSignal::Poison) | None => break,
                        }
                    }
                    value = inputs[0].recv() => value,
                };
                match head {
                    None => break,
                    Some(first) => {
                        let mut tuple = vec![first];
                        let mut closed = false;
                        for rx in inputs.iter_mut().skip(1) {
                            match rx.recv().await {
                                Some(value) => tuple.push(value),
                                None => {
                                    closed = true;
                                    break;
                                }
                            }
                        }
                        if closed {
                            None
                        } else {
                            Some(tuple)
                        }
                    }
                }
            };
            let Some(tuple) = tuple else { break };

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("semaphore closed");
            if self.config.max_forks == 1 {
                // Blocking dispatch: submit and wait before the next binding.
                Arc::clone(&self).run_binding(tuple, None).await;
                drop(permit);
            } else {
                let processor = Arc::clone(&self);
                bindings.spawn(async move {
                    processor.run_binding(tuple, None).await;
                    drop(permit);
                });
            }

            if single_shot {
                break;
            }
        }

        while bindings.join_next().await.is_some() {}

        self.close_outputs();
        self.session.deregister_processor(self.id).await;
        self.session.notify_process_terminate();
        for observer in &self.observers {
            observer.on_process_terminate(&self.config.name).await;
        }
        debug!(
            "Processor {} terminated ({} submitted, {} completed)",
            self.config.name,
            self.state.submitted(),
            self.state.completed()
        );
    }

    fn close_outputs(&self) {
        self.outputs.lock().expect("outputs poisoned").clear();
    }

    /// Drive one binding through the task lifecycle. Boxed so retries can
    /// re-enter with a fresh attempt.
    fn run_binding(
        self: Arc<Self>,
        values: Vec<Value>,
        prior: Option<Box<TaskRun>>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut task = match prior {
                Some(previous) => previous.make_retry(),
                None => {
                    let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
                    let mut task =
                        TaskRun::new(self.id, self.config.name.clone(), index, self.body.clone());
                    task.config = self.config.directives.clone();
                    task
                }
            };

            // Context stage 1 and 2: bind plain values, then stage files.
            // Scratch files are per-attempt so concurrent bindings never
            // overwrite each other's materialized values.
            let scratch = self
                .session
                .work_dir()
                .join(".staging")
                .join(task.id.to_string());
            let mut staged: Vec<StagedFile> = Vec::new();
            for (decl, value) in self.config.inputs.iter().zip(values.iter()) {
                match &decl.kind {
                    InputKind::Val | InputKind::Each => {
                        task.set_input(&decl.name, value.clone());
                    }
                    InputKind::File(pattern) => {
                        match normalize_file_input(&decl.name, pattern, value, &scratch) {
                            Ok(mut files) => {
                                task.inputs.insert(decl.name.clone(), value.clone());
                                let mut bound: Vec<Value> = files
                                    .iter()
                                    .map(|f| Value::path(f.target.clone()))
                                    .collect();
                                let bound = if bound.len() == 1 {
                                    bound.remove(0)
                                } else {
                                    Value::List(bound)
                                };
                                task.context.set(decl.name.clone(), bound);
                                staged.append(&mut files);
                            }
                            Err(e) => {
                                let failure = match e {
                                    StagingError::Io(io) => TaskFailure::Abort(io.to_string()),
                                    other => TaskFailure::NotRecoverable(other.to_string()),
                                };
                                // The binding counts even though it never
                                // reaches submission; completed <= submitted
                                // must hold at terminal state.
                                self.state.add_submitted();
                                self.handle_failure(task, failure, values.clone()).await;
                                return;
                            }
                        }
                    }
                }
            }

            // The when guard: false skips, an evaluation error is terminal
            // for the task but leaves the operator running.
            if let Some(guard) = self.config.when {
                match guard(&task.context) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Task {} skipped by when guard", task.name());
                        return;
                    }
                    Err(message) => {
                        self.state.add_submitted();
                        self.handle_failure(task, TaskFailure::GuardFailure(message), values.clone())
                            .await;
                        return;
                    }
                }
            }

            // A populated store dir short-circuits as cached.
            if let Some(store_dir) = task.config.store_dir.clone() {
                if self.try_store_dir(&mut task, &store_dir, &staged).await {
                    return;
                }
            }

            let hash = match self.fingerprint(&task) {
                Ok(hash) => hash,
                Err(failure) => {
                    self.state.add_submitted();
                    self.handle_failure(task, failure, values.clone()).await;
                    return;
                }
            };

            self.check_cached_or_launch(task, hash, staged, values).await;
        })
    }

    /// The cache probe and submit loop: rehash on work-dir collisions,
    /// resume when the previous attempt's outputs verify, submit otherwise.
    async fn check_cached_or_launch(
        self: &Arc<Self>,
        mut task: TaskRun,
        hash: TaskHash,
        staged: Vec<StagedFile>,
        values: Vec<Value>,
    ) {
        let should_try_cache = self.session.resume_mode() && self.session.cacheable();
        let mut tries: u32 = if task.run_type == RunType::Retry { 1 } else { 0 };

        loop {
            let current = hash.rehash(tries);
            let folder = self
                .session
                .work_dir()
                .join(current.prefix())
                .join(current.suffix());

            let existed = {
                let _guard = self.session.work_dir_lock().lock().await;
                let existed = folder.exists();
                if !existed {
                    if let Err(e) = std::fs::create_dir_all(&folder) {
                        let failure = TaskFailure::Abort(format!(
                            "cannot create work dir {}: {}",
                            folder.display(),
                            e
                        ));
                        self.state.add_submitted();
                        self.handle_failure(task, failure, values).await;
                        return;
                    }
                }
                existed
            };

            if should_try_cache
                && existed
                && self.try_resume(&mut task, current, &folder, &staged).await
            {
                return;
            }
            if existed {
                // Folder taken by a different task: derive the next hash.
                debug!(
                    "Work dir collision for task {} at {}",
                    task.name(),
                    folder.display()
                );
                tries += 1;
                continue;
            }

            task.assign_hash(current, self.session.work_dir());
            self.submit_task(task, current, staged, values).await;
            return;
        }
    }

    /// Verify a previous attempt in `folder` and rebind its outputs.
    async fn try_resume(
        self: &Arc<Self>,
        task: &mut TaskRun,
        hash: TaskHash,
        folder: &Path,
        staged: &[StagedFile],
    ) -> bool {
        let entry = match self.session.cache().get_entry(&hash) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                debug!("Cache entry for {} unreadable: {}", hash, e);
                return false;
            }
        };

        if task.body.is_script() {
            let paths = TaskPaths::new(folder);
            match paths.read_exit_status() {
                Some(code) if task.config.is_valid_exit(code) => task.exit_status = code,
                _ => return false,
            }
        }

        if let Some(context) = entry.context.clone() {
            task.context = context;
        }

        let staged_names: Vec<String> = staged.iter().map(|s| s.target.clone()).collect();
        let collected = match outputs::collect_outputs(
            &self.config.outputs,
            folder,
            &task.context,
            &staged_names,
            task.body.is_script(),
        ) {
            Ok(collected) => collected,
            Err(e) => {
                debug!("Cached outputs for {} not collectable: {}", task.name(), e);
                return false;
            }
        };

        task.assign_hash(hash, self.session.work_dir());
        task.mark_cached();
        task.outputs = collected.clone();
        self.state.add_submitted();

        if let Some(writer) = self.session.cache_writer() {
            let _ = writer.inc(hash);
            let _ = writer.index(hash, true);
        }

        self.bind_outputs(&collected).await;

        let mut trace = entry.trace.clone();
        trace.set_status("CACHED");
        trace.set(fields::CACHED, TraceValue::Bool(true));
        for observer in &self.observers {
            observer.on_task_cached(&trace).await;
        }
        self.state.add_completed();
        info!("[{}] Cached process > {}", short_hash(&hash), task.name());
        true
    }

    /// Short-circuit a task whose declared file outputs already sit in its
    /// store dir.
    async fn try_store_dir(
        self: &Arc<Self>,
        task: &mut TaskRun,
        store_dir: &Path,
        staged: &[StagedFile],
    ) -> bool {
        let all_files = self
            .config
            .outputs
            .iter()
            .all(|decl| matches!(decl.kind, OutputKind::File { .. }));
        if !all_files {
            return false;
        }
        let staged_names: Vec<String> = staged.iter().map(|s| s.target.clone()).collect();
        let collected = match outputs::collect_outputs(
            &self.config.outputs,
            store_dir,
            &task.context,
            &staged_names,
            false,
        ) {
            Ok(collected) => collected,
            Err(_) => return false,
        };

        task.work_dir = Some(store_dir.to_path_buf());
        task.mark_cached();
        task.outputs = collected.clone();
        task.exit_status = 0;
        self.state.add_submitted();
        self.bind_outputs(&collected).await;

        let mut trace = TraceRecord::from_task(task);
        trace.set_status("CACHED");
        for observer in &self.observers {
            observer.on_task_cached(&trace).await;
        }
        self.state.add_completed();
        info!("Task {} resolved from store dir {}", task.name(), store_dir.display());
        true
    }

    /// Launch a non-cached task and drive it to its final disposition.
    async fn submit_task(
        self: &Arc<Self>,
        mut task: TaskRun,
        hash: TaskHash,
        staged: Vec<StagedFile>,
        values: Vec<Value>,
    ) {
        self.state.add_submitted();
        let folder = task
            .work_dir()
            .expect("work dir assigned before submit")
            .to_path_buf();
        let staged_names: Vec<String> = staged.iter().map(|s| s.target.clone()).collect();

        let mut trace = TraceRecord::from_task(&task);
        trace.set_status("SUBMITTED");
        trace.set_submit(Utc::now());
        for observer in &self.observers {
            observer.on_task_submit(&trace).await;
        }

        match task.body.clone() {
            TaskBody::Native { func, .. } => {
                trace.set_start(Utc::now());
                match func(&task.context) {
                    Ok(result) => {
                        task.exit_status = 0;
                        task.context.set("result", result);
                        if let Ok(bytes) = task.context.to_bytes() {
                            let _ = std::fs::write(TaskPaths::new(&folder).context(), bytes);
                        }
                        self.finalize_success(task, hash, trace, &staged_names, values)
                            .await;
                    }
                    Err(message) => {
                        warn!("Native task {} failed: {}", task.name(), message);
                        task.exit_status = 1;
                        self.handle_failure(task, TaskFailure::ProcessFailed(1), values)
                            .await;
                    }
                }
            }
            TaskBody::Script { source } => {
                let headers = self.monitor.executor().task_headers(&task);
                let mut launcher = TaskLauncher::new(&folder, task.name(), source.clone())
                    .headers(headers)
                    .staged_files(staged.clone())
                    .context(task.context.clone())
                    .bin_dir(Some(self.session.base_dir().join("bin")));
                if let Some(store_dir) = &task.config.store_dir {
                    launcher = launcher.unstage(
                        self.file_output_patterns(),
                        store_dir.clone(),
                        task.config.stage_mode,
                    );
                }
                if let Err(e) = launcher.write() {
                    self.handle_failure(task, TaskFailure::Abort(e.to_string()), values)
                        .await;
                    return;
                }
                task.script = Some(source);

                let handle = match self.monitor.executor().submit(&task).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.handle_failure(task, TaskFailure::Abort(e.to_string()), values)
                            .await;
                        return;
                    }
                };
                trace.set(
                    fields::NATIVE_ID,
                    TraceValue::Str(handle.native_id.clone()),
                );
                trace.set_start(Utc::now());
                info!(
                    "[{}] Submitted process > {}",
                    short_hash(&hash),
                    task.name()
                );

                let completion = self.monitor.watch(handle).await;
                let final_state = completion.await.unwrap_or(ExecState::Failed);

                let exit = TaskPaths::new(&folder)
                    .read_exit_status()
                    .unwrap_or(EXIT_UNKNOWN);
                task.mark_complete(exit);

                if final_state == ExecState::Failed || !task.config.is_valid_exit(exit) {
                    self.handle_failure(task, TaskFailure::ProcessFailed(exit), values)
                        .await;
                    return;
                }
                self.finalize_success(task, hash, trace, &staged_names, values)
                    .await;
            }
        }
    }

    /// Collect outputs, bind them atomically, persist the cache entry and
    /// the index record.
    async fn finalize_success(
        self: &Arc<Self>,
        mut task: TaskRun,
        hash: TaskHash,
        mut trace: TraceRecord,
        staged_names: &[String],
        values: Vec<Value>,
    ) {
        let folder = task
            .work_dir()
            .expect("work dir assigned before finalize")
            .to_path_buf();

        let collected = match outputs::collect_outputs(
            &self.config.outputs,
            &folder,
            &task.context,
            staged_names,
            task.body.is_script(),
        ) {
            Ok(collected) => collected,
            Err(failure) => {
                self.handle_failure(task, failure, values).await;
                return;
            }
        };

        task.outputs = collected.clone();
        trace.set_exit(task.exit_status);
        trace.set_complete(Utc::now());
        trace.set_status("COMPLETED");

        self.bind_outputs(&collected).await;

        if self.session.cacheable() {
            if let Some(writer) = self.session.cache_writer() {
                let _ = writer.put(hash, trace.clone(), Some(task.context.clone()));
                let _ = writer.index(hash, false);
            }
        }

        for observer in &self.observers {
            observer.on_task_complete(&trace).await;
        }
        self.state.add_completed();
        debug!("Task {} completed (exit {})", task.name(), task.exit_status);
    }

    /// Emit all outputs of one task before any other task of this
    /// processor may emit.
    async fn bind_outputs(&self, collected: &indexmap::IndexMap<String, Value>) {
        let _guard = self.output_lock.lock().await;
        let senders = self.outputs.lock().expect("outputs poisoned").clone();
        for (decl, sender) in self.config.outputs.iter().zip(senders.iter()) {
            let Some(value) = collected.get(&decl.name) else {
                continue;
            };
            for item in outputs::expand_for_binding(value, decl.mode) {
                if sender.send(item).await.is_err() {
                    debug!("Output channel for {} closed", decl.name);
                    break;
                }
            }
        }
    }

    fn file_output_patterns(&self) -> Vec<String> {
        self.config
            .outputs
            .iter()
            .filter_map(|decl| match &decl.kind {
                OutputKind::File { pattern, .. } => Some(pattern.clone()),
                _ => None,
            })
            .collect()
    }

    /// Compute the task fingerprint over the canonical item sequence.
    fn fingerprint(&self, task: &TaskRun) -> std::result::Result<TaskHash, TaskFailure> {
        let mut builder = FingerprintBuilder::new(task.config.hash_mode);
        builder.push_str(&self.session.unique_id().to_string());
        builder.push_str(&self.config.name);
        builder.push_str(task.body.source());

        for decl in &self.config.inputs {
            let value = task.inputs.get(&decl.name).cloned().unwrap_or(Value::Null);
            match &decl.kind {
                InputKind::Val | InputKind::Each => {
                    builder.push_named(&decl.name, &value);
                }
                InputKind::File(_) => {
                    let mut leaves = Vec::new();
                    value.flatten_into(&mut leaves);
                    let paths: Vec<&Path> = leaves.iter().filter_map(Value::as_path).collect();
                    builder
                        .push_file_bag(&decl.name, &paths)
                        .map_err(|e| TaskFailure::Abort(e.to_string()))?;
                }
            }
        }

        for name in &self.config.free_var_names {
            let value = self
                .config
                .binding
                .get(name)
                .cloned()
                .unwrap_or(Value::Null);
            builder.push_named(name, &value);
        }
        Ok(builder.finish())
    }

    /// Apply the error strategy to a failed attempt.
    fn handle_failure(
        self: &Arc<Self>,
        mut task: TaskRun,
        failure: TaskFailure,
        values: Vec<Value>,
    ) -> BoxFuture<'static, ()> {
        let processor = Arc::clone(self);
        Box::pin(async move {
            task.mark_failed();
            let error_count = processor.state.errors.fetch_add(1, Ordering::SeqCst) + 1;
            let action = classify(&task, &failure, error_count);

            match action {
                ErrorAction::Retry => {
                    processor.state.add_completed();
                    info!(
                        "[{}] NOTE: {} -- Execution is retried (attempt {})",
                        task.name(),
                        failure,
                        task.fail_count + 1
                    );
                    Arc::clone(&processor)
                        .run_binding(values, Some(Box::new(task)))
                        .await;
                }
                ErrorAction::Ignore => {
                    processor.state.add_completed();
                    warn!("Task {} failed but errors are ignored: {}", task.name(), failure);
                }
                ErrorAction::Finish => {
                    processor.state.add_completed();
                    processor.state.set_finished();
                    error!(
                        "Task {} failed; waiting for in-flight tasks before stopping: {}",
                        task.name(),
                        failure
                    );
                }
                ErrorAction::Terminate => {
                    processor.state.add_completed();
                    processor.state.set_finished();
                    let report = build_report(&task, &failure);
                    processor
                        .session
                        .fault(RunFault {
                            process: processor.config.name.clone(),
                            task_name: task.name(),
                            report,
                        })
                        .await;
                }
            }
        })
    }
}

fn short_hash(hash: &TaskHash) -> String {
    let hex = hash.to_hex();
    format!("{}/{}", &hex[..2], &hex[2..8])
}
