// ABOUTME: IBM LSF scheduler wire implementation
// ABOUTME: Renders #BSUB directives and drives bsub, bjobs and bkill

use std::collections::HashMap;

use regex::Regex;

use super::error::{ExecutorError, Result};
use super::grid::{GridScheduler, QueueStatus};
use super::job_name;
use crate::script::{TaskPaths, CMD_LOG, CMD_RUN};
use crate::task::TaskRun;

pub struct LsfScheduler;

impl GridScheduler for LsfScheduler {
    fn name(&self) -> &'static str {
        "lsf"
    }

    fn directive_token(&self) -> &'static str {
        "#BSUB"
    }

    fn render_directives(&self, task: &TaskRun) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(dir) = task.work_dir() {
            lines.push(format!("#BSUB -cwd {}", dir.display()));
            lines.push(format!("#BSUB -o {}/{}", dir.display(), CMD_LOG));
        }
        lines.push(format!("#BSUB -J {}", job_name(&task.name())));
        if let Some(queue) = &task.config.queue {
            lines.push(format!("#BSUB -q {}", queue));
        }
        if task.config.cpus > 1 {
            lines.push(format!("#BSUB -n {}", task.config.cpus));
        }
        if let Some(time) = task.config.time {
            lines.push(format!("#BSUB -W {:02}:{:02}", time.minutes() / 60, time.minutes() % 60));
        }
        if let Some(memory) = task.config.memory {
            lines.push(format!("#BSUB -M {}", memory.mega()));
        }
        if let Some(options) = &task.config.cluster_options {
            lines.push(format!("#BSUB {}", options));
        }
        lines
    }

    fn submit_command(&self, _task: &TaskRun, _paths: &TaskPaths) -> Vec<String> {
        // bsub reads the job script, directives included, from stdin.
        vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            format!("bsub < {}", CMD_RUN),
        ]
    }

    fn parse_job_id(&self, stdout: &str) -> Result<String> {
        let re = Regex::new(r"Job <(\d+)>").expect("valid regex");
        re.captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExecutorError::JobIdParse(stdout.trim().to_string()))
    }

    fn queue_status_command(&self, queue: Option<&str>, user: Option<&str>) -> Vec<String> {
        let mut argv = vec![
            "bjobs".to_string(),
            "-o".to_string(),
            "JOBID STAT".to_string(),
            "-noheader".to_string(),
        ];
        if let Some(queue) = queue {
            argv.push("-q".to_string());
            argv.push(queue.to_string());
        }
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
                "PEND" | "WAIT" | "PROV" => QueueStatus::Pending,
                "RUN" => QueueStatus::Running,
                "DONE" => QueueStatus::Done,
                "EXIT" | "UNKWN" | "ZOMBI" => QueueStatus::Error,
                "PSUSP" | "USUSP" | "SSUSP" => QueueStatus::Hold,
                _ => continue,
            };
            map.insert(id.to_string(), status);
        }
        map
    }

    fn kill_command(&self, job_id: &str) -> Vec<String> {
        vec!["bkill".to_string(), job_id.to_string()]
    }
}
