// ABOUTME: Slurm scheduler wire implementation
// ABOUTME: Renders #SBATCH directives and drives sbatch, squeue and scancel

use std::collections::HashMap;

use regex::Regex;

use super::error::{ExecutorError, Result};
use super::grid::{GridScheduler, QueueStatus};
use super::job_name;
use crate::script::{TaskPaths, CMD_LOG, CMD_RUN};
use crate::task::TaskRun;

pub struct SlurmScheduler;

impl GridScheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn directive_token(&self) -> &'static str {
        "#SBATCH"
    }

    fn render_directives(&self, task: &TaskRun) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(dir) = task.work_dir() {
            lines.push(format!("#SBATCH -D {}", dir.display()));
            lines.push(format!("#SBATCH -J {}", job_name(&task.name())));
            lines.push(format!("#SBATCH -o {}/{}", dir.display(), CMD_LOG));
        } else {
            lines.push(format!("#SBATCH -J {}", job_name(&task.name())));
        }
        if task.config.cpus > 1 {
            lines.push(format!("#SBATCH -c {}", task.config.cpus));
        }
        if let Some(time) = task.config.time {
            lines.push(format!("#SBATCH -t {}", time.to_hms()));
        }
        if let Some(memory) = task.config.memory {
            lines.push(format!("#SBATCH --mem {}", memory.mega()));
        }
        if let Some(queue) = &task.config.queue {
            lines.push(format!("#SBATCH -p {}", queue));
        }
        if let Some(options) = &task.config.cluster_options {
            lines.push(format!("#SBATCH {}", options));
        }
        lines
    }

    fn submit_command(&self, _task: &TaskRun, _paths: &TaskPaths) -> Vec<String> {
        vec!["sbatch".to_string(), CMD_RUN.to_string()]
    }

    fn parse_job_id(&self, stdout: &str) -> Result<String> {
        let re = Regex::new(r"Submitted batch job (\d+)").expect("valid regex");
        re.captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExecutorError::JobIdParse(stdout.trim().to_string()))
    }

    fn queue_status_command(&self, _queue: Option<&str>, user: Option<&str>) -> Vec<String> {
        let mut argv = vec![
            "squeue".to_string(),
            "-h".to_string(),
            "-o".to_string(),
            "%i %t".to_string(),
            "-t".to_string(),
            "all".to_string(),
        ];
        if let Some(user) = user {
            argv.push("-u".to_string());
            argv.push(user.to_string());
        }
        argv
    }

    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut map = HashMap::new();
        for line in stdout.lines() {
            let mut cols = line.split_whitespace();
            let (Some(id), Some(code)) = (cols.next(), cols.next()) else {
                continue;
            };
            let status = match code {
                "PD" | "CF" => QueueStatus::Pending,
                "R" | "CG" => QueueStatus::Running,
                "CD" => QueueStatus::Done,
                "S" | "ST" => QueueStatus::Hold,
                "CA" | "F" | "TO" | "NF" | "PR" | "SE" => QueueStatus::Error,
                _ => continue,
            };
            map.insert(id.to_string(), status);
        }
        map
    }

    fn kill_command(&self, job_id: &str) -> Vec<String> {
        vec!["scancel".to_string(), job_id.to_string()]
    }
}
