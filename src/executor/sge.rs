// ABOUTME: Sun Grid Engine scheduler wire implementation
// ABOUTME: Renders #$ directives and drives qsub, qstat and qdel

use std::collections::HashMap;

use regex::Regex;

use super::error::{ExecutorError, Result};
use super::grid::{GridScheduler, QueueStatus};
use super::job_name;
use crate::script::{TaskPaths, CMD_LOG, CMD_RUN};
use crate::task::TaskRun;

pub struct SgeScheduler;

impl GridScheduler for SgeScheduler {
    fn name(&self) -> &'static str {
        "sge"
    }

    fn directive_token(&self) -> &'static str {
        "#$"
    }

    fn render_directives(&self, task: &TaskRun) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(dir) = task.work_dir() {
            lines.push(format!("#$ -wd {}", dir.display()));
            lines.push(format!("#$ -o {}/{}", dir.display(), CMD_LOG));
        }
        lines.push(format!("#$ -N {}", job_name(&task.name())));
        lines.push("#$ -j y".to_string());
        lines.push("#$ -terse".to_string());
        if let Some(queue) = &task.config.queue {
            lines.push(format!("#$ -q {}", queue));
        }
        if task.config.cpus > 1 {
            lines.push(format!("#$ -pe smp {}", task.config.cpus));
        }
        if let Some(time) = task.config.time {
            lines.push(format!("#$ -l h_rt={}", time.to_hms()));
        }
        if let Some(memory) = task.config.memory {
            lines.push(format!("#$ -l h_rss={}M", memory.mega()));
        }
        if let Some(options) = &task.config.cluster_options {
            lines.push(format!("#$ {}", options));
        }
        lines
    }

    fn submit_command(&self, _task: &TaskRun, _paths: &TaskPaths) -> Vec<String> {
        vec!["qsub".to_string(), "-terse".to_string(), CMD_RUN.to_string()]
    }

    fn parse_job_id(&self, stdout: &str) -> Result<String> {
        // With -terse the job id is the whole first line; array jobs append
        // a task range after a dot.
        let re = Regex::new(r"(?m)^(\d+)").expect("valid regex");
        re.captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExecutorError::JobIdParse(stdout.trim().to_string()))
    }

    fn queue_status_command(&self, queue: Option<&str>, _user: Option<&str>) -> Vec<String> {
        let mut argv = vec!["qstat".to_string()];
        if let Some(queue) = queue {
            argv.push("-q".to_string());
            argv.push(queue.to_string());
        }
        argv
    }

    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut map = HashMap::new();
        for line in stdout.lines() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let status = match cols[4] {
                "qw" | "w" => QueueStatus::Pending,
                "r" | "t" => QueueStatus::Running,
                "hqw" | "hRwq" | "s" | "S" | "T" => QueueStatus::Hold,
                "Eqw" | "Ehqw" | "dr" | "dt" => QueueStatus::Error,
                _ => continue,
            };
            map.insert(cols[0].to_string(), status);
        }
        map
    }

    fn kill_command(&self, job_id: &str) -> Vec<String> {
        vec!["qdel".to_string(), job_id.to_string()]
    }
}
