// ABOUTME: End-to-end pipeline tests over the local executor
// ABOUTME: Covers output binding, index order, resume idempotence and error strategies

use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use headway::cache::IndexReader;
use headway::executor::{Executor, TaskMonitor};
use headway::processor::{
    data_channel, InputDecl, OutputDecl, ProcessConfig, TaskProcessor,
};
use headway::session::SessionBuilder;
use headway::task::{ErrorStrategy, TaskBody, Value};
use headway::trace::TraceObserver;

mod common;
use common::{CollectingObserver, CountingExecutor};

struct PipelineRun {
    session_id: Uuid,
    submissions: usize,
    cached: usize,
    completed: usize,
    outputs: Vec<Value>,
    index: Vec<(String, bool)>,
    faulted: bool,
}

async fn run_single_process(
    base: &std::path::Path,
    run_name: &str,
    resume: Option<Uuid>,
    script: &str,
    config: ProcessConfig,
    inputs: Vec<Vec<Value>>,
) -> PipelineRun {
    let mut builder = SessionBuilder::new(base)
        .work_dir(base.join("work"))
        .run_name(run_name);
    if let Some(id) = resume {
        builder = builder.resume(id);
    }
    let session = builder.start("headway run test").await.unwrap();

    let executor = CountingExecutor::new();
    let monitor = TaskMonitor::spawn(Arc::clone(&executor) as Arc<dyn Executor>);
    let observer = Arc::new(CollectingObserver::default());

    let mut input_rx = Vec::new();
    let mut input_tx = Vec::new();
    for _ in 0..config.inputs.len() {
        let (tx, rx) = data_channel();
        input_tx.push(tx);
        input_rx.push(rx);
    }
    let (out_tx, mut out_rx) = data_channel();

    let (_processor, handle) = TaskProcessor::spawn(
        config,
        TaskBody::script(script),
        Arc::clone(&session),
        Arc::clone(&monitor),
        vec![Arc::clone(&observer) as Arc<dyn TraceObserver>],
        input_rx,
        vec![out_tx],
    )
    .await;

    for (position, values) in inputs.into_iter().enumerate() {
        for value in values {
            input_tx[position].send(value).await.unwrap();
        }
    }
    drop(input_tx);

    handle.await.unwrap();
    session.await_termination().await;
    session.shutdown().await;
    monitor.stop().await;

    let mut outputs = Vec::new();
    while let Ok(value) = out_rx.try_recv() {
        outputs.push(value);
    }

    let index = IndexReader::open(&session.cache().index_path())
        .unwrap()
        .records()
        .unwrap()
        .into_iter()
        .map(|r| (r.hash.to_hex(), r.cached))
        .collect();

    PipelineRun {
        session_id: session.session_id(),
        submissions: executor.submissions(),
        cached: observer.cached.load(std::sync::atomic::Ordering::SeqCst),
        completed: observer.completed.load(std::sync::atomic::Ordering::SeqCst),
        outputs,
        index,
        faulted: session.first_fault().is_some(),
    }
}

fn echo_config() -> ProcessConfig {
    ProcessConfig::new("echo_task")
        .input(InputDecl::val("x"))
        .output(OutputDecl::stdout("out"))
        .max_forks(1)
}

fn int_stream(values: &[i64]) -> Vec<Vec<Value>> {
    vec![values.iter().map(|&v| Value::Int(v)).collect()]
}

#[tokio::test]
async fn pipeline_executes_and_binds_outputs_in_order() {
    let base = TempDir::new().unwrap();
    let run = run_single_process(
        base.path(),
        "first_run",
        None,
        "echo value-$x",
        echo_config(),
        int_stream(&[1, 2, 3]),
    )
    .await;

    assert!(!run.faulted);
    assert_eq!(run.submissions, 3);
    assert_eq!(run.completed, 3);
    assert_eq!(run.cached, 0);

    let stdout: Vec<String> = run
        .outputs
        .iter()
        .map(|v| v.render().trim().to_string())
        .collect();
    assert_eq!(stdout, vec!["value-1", "value-2", "value-3"]);

    assert_eq!(run.index.len(), 3);
    assert!(run.index.iter().all(|(_, cached)| !*cached));
    // Three distinct bindings, three distinct fingerprints.
    let unique: std::collections::HashSet<&String> =
        run.index.iter().map(|(h, _)| h).collect();
    assert_eq!(unique.len(), 3);
}

#[tokio::test]
async fn resume_replays_every_task_from_cache() {
    let base = TempDir::new().unwrap();
    let first = run_single_process(
        base.path(),
        "original",
        None,
        "echo value-$x",
        echo_config(),
        int_stream(&[1, 2, 3]),
    )
    .await;
    assert_eq!(first.submissions, 3);

    let second = run_single_process(
        base.path(),
        "resumed",
        Some(first.session_id),
        "echo value-$x",
        echo_config(),
        int_stream(&[1, 2, 3]),
    )
    .await;

    // No executor submission may be issued on a full resume.
    assert_eq!(second.submissions, 0);
    assert_eq!(second.cached, 3);
    assert!(!second.faulted);

    let stdout: Vec<String> = second
        .outputs
        .iter()
        .map(|v| v.render().trim().to_string())
        .collect();
    assert_eq!(stdout, vec!["value-1", "value-2", "value-3"]);

    // The resumed run's index replays the same hashes, flagged cached.
    let first_hashes: Vec<&String> = first.index.iter().map(|(h, _)| h).collect();
    let second_hashes: Vec<&String> = second.index.iter().map(|(h, _)| h).collect();
    assert_eq!(first_hashes, second_hashes);
    assert!(second.index.iter().all(|(_, cached)| *cached));
}

#[tokio::test]
async fn failing_task_faults_session_by_default() {
    let base = TempDir::new().unwrap();
    let run = run_single_process(
        base.path(),
        "failing",
        None,
        "exit 3",
        echo_config(),
        int_stream(&[1]),
    )
    .await;

    assert!(run.faulted);
    assert!(run.outputs.is_empty());
}

#[tokio::test]
async fn ignore_strategy_continues_past_failures() {
    let base = TempDir::new().unwrap();
    let mut config = echo_config();
    config.directives.error_strategy = ErrorStrategy::Ignore;

    let run = run_single_process(
        base.path(),
        "ignoring",
        None,
        "exit 1",
        config,
        int_stream(&[1, 2]),
    )
    .await;

    assert!(!run.faulted);
    assert_eq!(run.submissions, 2);
    assert!(run.outputs.is_empty());
    assert!(run.index.is_empty());
}

#[tokio::test]
async fn retry_strategy_reruns_failed_attempt() {
    let base = TempDir::new().unwrap();
    let marker = base.path().join("attempt.marker");

    let mut config = ProcessConfig::new("flaky")
        .input(InputDecl::val("marker"))
        .output(OutputDecl::stdout("out"))
        .max_forks(1);
    config.directives.error_strategy = ErrorStrategy::Retry;
    config.directives.max_retries = 2;

    let script = r#"if [ -e "$marker" ]; then echo recovered; else touch "$marker"; exit 1; fi"#;
    let run = run_single_process(
        base.path(),
        "flaky_run",
        None,
        script,
        config,
        vec![vec![Value::str(marker.display().to_string())]],
    )
    .await;

    assert!(!run.faulted);
    assert_eq!(run.submissions, 2);
    assert_eq!(
        run.outputs
            .first()
            .map(|v| v.render().trim().to_string()),
        Some("recovered".to_string())
    );
}

#[tokio::test]
async fn guard_evaluation_error_is_task_terminal_only() {
    fn failing_guard(
        _context: &headway::task::TaskContext,
    ) -> std::result::Result<bool, String> {
        Err("unknown property 'sample'".to_string())
    }

    let base = TempDir::new().unwrap();
    let config = echo_config().when(failing_guard);

    let run = run_single_process(
        base.path(),
        "guarded",
        None,
        "echo never",
        config,
        int_stream(&[1, 2]),
    )
    .await;

    // Every binding dies on the guard, but the session must not fault and
    // nothing may reach the executor.
    assert!(!run.faulted);
    assert_eq!(run.submissions, 0);
    assert!(run.outputs.is_empty());
    assert!(run.index.is_empty());
}

#[tokio::test]
async fn each_input_multiplies_bindings() {
    let base = TempDir::new().unwrap();
    let config = ProcessConfig::new("expand")
        .input(InputDecl::val("x"))
        .input(InputDecl::each("e"))
        .output(OutputDecl::stdout("out"))
        .max_forks(1);

    let inputs = vec![
        vec![Value::Int(10)],
        vec![Value::List(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ])],
    ];
    let run = run_single_process(
        base.path(),
        "each_run",
        None,
        "echo $x-$e",
        config,
        inputs,
    )
    .await;

    assert!(!run.faulted);
    assert_eq!(run.submissions, 3);
    let mut stdout: Vec<String> = run
        .outputs
        .iter()
        .map(|v| v.render().trim().to_string())
        .collect();
    stdout.sort();
    assert_eq!(stdout, vec!["10-1", "10-2", "10-3"]);
}
