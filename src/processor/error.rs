// ABOUTME: Task failure kinds, error-strategy classification and fault reports
// ABOUTME: One classify function maps a failure and its strategy to an explicit action

use std::path::Path;

use thiserror::Error;

use crate::script::TaskPaths;
use crate::task::{ErrorStrategy, TaskRun};

/// What went wrong with a task attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskFailure {
    /// The user script could not be compiled or rendered at all.
    #[error("Process script is not valid: {0}")]
    NotRecoverable(String),

    /// The process ran and failed (non-zero or unexpected exit).
    #[error("Process exited with status {0}")]
    ProcessFailed(i32),

    /// A declared output was not collectible.
    #[error("Missing output: {0}")]
    MissingOutput(String),

    /// A declared value output references an unknown context name.
    #[error("Missing output value: {0}")]
    MissingValue(String),

    /// Infrastructure failure: IO, scheduler lost, submit refused.
    #[error("Execution aborted: {0}")]
    Abort(String),

    /// The `when` guard raised while evaluating.
    #[error("Guard evaluation failed: {0}")]
    GuardFailure(String),
}

impl TaskFailure {
    /// Failures that terminate the run regardless of the configured
    /// strategy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskFailure::NotRecoverable(_) | TaskFailure::Abort(_))
    }

    /// Failures the per-process strategy may absorb.
    pub fn honors_strategy(&self) -> bool {
        matches!(
            self,
            TaskFailure::ProcessFailed(_)
                | TaskFailure::MissingOutput(_)
                | TaskFailure::MissingValue(_)
        )
    }
}

/// The action the operator loop takes for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Fault the session.
    Terminate,
    /// Mark failed, accept no new bindings, let in-flight work finish.
    Finish,
    /// Log and continue.
    Ignore,
    /// Requeue a fresh attempt.
    Retry,
}

/// Decide how a failed attempt is handled.
///
/// Fatal failure kinds terminate regardless of strategy; a guard failure is
/// terminal for the task but leaves the processor running; everything else
/// follows the configured strategy with retry give-up rules applied
/// (`max_errors < 0` means unbounded).
pub fn classify(task: &TaskRun, failure: &TaskFailure, error_count: u64) -> ErrorAction {
    if failure.is_fatal() {
        return ErrorAction::Terminate;
    }
    if matches!(failure, TaskFailure::GuardFailure(_)) {
        return ErrorAction::Ignore;
    }
    match task.config.error_strategy {
        ErrorStrategy::Terminate => ErrorAction::Terminate,
        ErrorStrategy::Finish => ErrorAction::Finish,
        ErrorStrategy::Ignore => ErrorAction::Ignore,
        ErrorStrategy::Retry => {
            let within_retries = task.fail_count < task.config.max_retries;
            let within_errors =
                task.config.max_errors < 0 || (error_count as i64) <= task.config.max_errors;
            if within_retries && within_errors {
                ErrorAction::Retry
            } else {
                ErrorAction::Terminate
            }
        }
    }
}

const REPORT_TAIL_LINES: usize = 50;

/// Build the full failure report shown for the first error of a run:
/// command, exit status, stdout/stderr tails, the offending source block
/// and the work dir.
pub fn build_report(task: &TaskRun, failure: &TaskFailure) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Error executing process > '{}'\n\n",
        task.name()
    ));
    out.push_str(&format!("Caused by:\n  {}\n\n", failure));

    out.push_str("Command executed:\n");
    for line in task.body.source().lines() {
        out.push_str(&format!("  {}\n", line));
    }
    out.push('\n');

    let exit = if task.exit_status == crate::task::EXIT_UNKNOWN {
        "-".to_string()
    } else {
        task.exit_status.to_string()
    };
    out.push_str(&format!("Command exit status:\n  {}\n\n", exit));

    if let Some(dir) = task.work_dir() {
        let paths = TaskPaths::new(dir);
        out.push_str("Command output:\n");
        out.push_str(&tail_of(&paths.stdout(), REPORT_TAIL_LINES));
        out.push_str("\nCommand error:\n");
        out.push_str(&tail_of(&paths.stderr(), REPORT_TAIL_LINES));
        out.push_str(&format!("\nWork dir:\n  {}\n", dir.display()));
    }
    out
}

fn tail_of(path: &Path, max_lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(max_lines);
            let mut out = String::new();
            if start > 0 {
                out.push_str("  (more omitted)\n");
            }
            for line in &lines[start..] {
                out.push_str(&format!("  {}\n", line));
            }
            if lines.is_empty() {
                out.push_str("  (empty)\n");
            }
            out
        }
        Err(_) => "  (none)\n".to_string(),
    }
}
