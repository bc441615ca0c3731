// ABOUTME: PBS/Torque scheduler wire implementation
// ABOUTME: Renders #PBS directives and drives qsub, qstat and qdel

use std::collections::HashMap;

use regex::Regex;

use super::error::{ExecutorError, Result};
use super::grid::{GridScheduler, QueueStatus};
use super::job_name;
use crate::script::{TaskPaths, CMD_LOG, CMD_RUN};
use crate::task::TaskRun;

pub struct PbsScheduler;

impl GridScheduler for PbsScheduler {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn directive_token(&self) -> &'static str {
        "#PBS"
    }

    fn render_directives(&self, task: &TaskRun) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("#PBS -N {}", job_name(&task.name())));
        if let Some(dir) = task.work_dir() {
            lines.push(format!("#PBS -o {}/{}", dir.display(), CMD_LOG));
            lines.push("#PBS -j oe".to_string());
        }
        if let Some(queue) = &task.config.queue {
            lines.push(format!("#PBS -q {}", queue));
        }
        if task.config.cpus > 1 {
            lines.push(format!("#PBS -l nodes=1:ppn={}", task.config.cpus));
        }
        if let Some(time) = task.config.time {
            lines.push(format!("#PBS -l walltime={}", time.to_hms()));
        }
        if let Some(memory) = task.config.memory {
            lines.push(format!("#PBS -l mem={}mb", memory.mega()));
        }
        if let Some(options) = &task.config.cluster_options {
            lines.push(format!("#PBS {}", options));
        }
        lines
    }

    fn submit_command(&self, _task: &TaskRun, _paths: &TaskPaths) -> Vec<String> {
        vec!["qsub".to_string(), CMD_RUN.to_string()]
    }

    fn parse_job_id(&self, stdout: &str) -> Result<String> {
        // qsub prints the full job id, e.g. `12345.pbs-master`.
        let re = Regex::new(r"(?m)^(\d+(?:\.\S+)?)").expect("valid regex");
        re.captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExecutorError::JobIdParse(stdout.trim().to_string()))
    }

    fn queue_status_command(&self, queue: Option<&str>, _user: Option<&str>) -> Vec<String> {
        let mut argv = vec!["qstat".to_string()];
        if let Some(queue) = queue {
            argv.push(queue.to_string());
        }
        argv
    }

    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut map = HashMap::new();
        for line in stdout.lines() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            let status = match cols[4] {
                "Q" | "W" => QueueStatus::Pending,
                "R" | "E" => QueueStatus::Running,
                "C" => QueueStatus::Done,
                "H" | "S" => QueueStatus::Hold,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBody;
    use std::path::Path;

    #[test]
    fn test_directives() {
        let mut task = TaskRun::new(1, "call variants", 0, TaskBody::script("echo"));
        task.work_dir = Some(Path::new("/work/xy").to_path_buf());
        task.config.cpus = 8;
        task.config.time = Some("12h".parse().unwrap());
        task.config.memory = Some("16GB".parse().unwrap());
        task.config.queue = Some("batch".to_string());

        let headers = PbsScheduler.render_directives(&task);
        assert!(headers.contains(&"#PBS -N nf-call_variants".to_string()));
        assert!(headers.contains(&"#PBS -o /work/xy/.command.log".to_string()));
        assert!(headers.contains(&"#PBS -j oe".to_string()));
        assert!(headers.contains(&"#PBS -q batch".to_string()));
        assert!(headers.contains(&"#PBS -l nodes=1:ppn=8".to_string()));
        assert!(headers.contains(&"#PBS -l walltime=12:00:00".to_string()));
        assert!(headers.contains(&"#PBS -l mem=16384mb".to_string()));
    }

    #[test]
    fn test_job_id_parsing() {
        assert_eq!(
            PbsScheduler.parse_job_id("12345.pbs-master\n").unwrap(),
            "12345.pbs-master"
        );
        assert_eq!(PbsScheduler.parse_job_id("99\n").unwrap(), "99");
        assert!(PbsScheduler.parse_job_id("qsub: would exceed").is_err());
    }

    #[test]
    fn test_queue_status_parsing() {
        let stdout = "\
Job id            Name             User   Time Use S Queue\n\
----------------  ---------------- ------ -------- - -----\n\
12345.master      nf-align         alice  00:00:10 R batch\n\
12346.master      nf-sort          alice  0        Q batch\n\
12347.master      nf-call          alice  00:01:00 C batch\n";
        let map = PbsScheduler.parse_queue_status(stdout);
        assert_eq!(map.get("12345.master"), Some(&QueueStatus::Running));
        assert_eq!(map.get("12346.master"), Some(&QueueStatus::Pending));
        assert_eq!(map.get("12347.master"), Some(&QueueStatus::Done));
    }
}
