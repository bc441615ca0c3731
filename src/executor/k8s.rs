// ABOUTME: Kubernetes scheduler wire implementation
// ABOUTME: Renders a batch/v1 Job manifest with host-path volumes and drives kubectl

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;

use super::error::{ExecutorError, Result};
use super::grid::{GridScheduler, QueueStatus};
use crate::script::{TaskPaths, CMD_RUN};
use crate::task::{TaskRun, Value};

const DEFAULT_IMAGE: &str = "debian:stable";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobManifest {
    api_version: String,
    kind: String,
    metadata: Metadata,
    spec: JobSpec,
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSpec {
    backoff_limit: u32,
    template: PodTemplate,
}

#[derive(Debug, Serialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    restart_policy: String,
    containers: Vec<Container>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<Volume>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    name: String,
    image: String,
    command: Vec<String>,
    working_dir: String,
    resources: Resources,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Serialize)]
struct Resources {
    limits: ResourceAmounts,
    requests: ResourceAmounts,
}

#[derive(Debug, Serialize)]
struct ResourceAmounts {
    cpu: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeMount {
    name: String,
    mount_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    name: String,
    host_path: HostPath,
}

#[derive(Debug, Serialize)]
struct HostPath {
    path: String,
}

/// Kubernetes backend settings: the container image fallback and an
/// optional bin dir mounted alongside the inputs.
pub struct KubeScheduler {
    pub image: String,
    pub bin_dir: Option<PathBuf>,
}

impl Default for KubeScheduler {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            bin_dir: None,
        }
    }
}

impl KubeScheduler {
    /// RFC-1123 flavored job name: lowercase, non-alphanumerics collapse to
    /// a dash, task id appended for uniqueness.
    pub fn kube_job_name(task: &TaskRun) -> String {
        let mut sanitized = String::new();
        let mut last_was_sep = false;
        for c in task.name().chars() {
            if c.is_ascii_alphanumeric() {
                sanitized.push(c.to_ascii_lowercase());
                last_was_sep = false;
            } else if !last_was_sep && !sanitized.is_empty() {
                sanitized.push('-');
                last_was_sep = true;
            }
        }
        let sanitized = sanitized.trim_end_matches('-');
        format!("nf-{}-{}", sanitized, task.id)
    }

    /// Collapse a path set to its longest common prefixes: every path is
    /// covered by exactly one returned root.
    pub fn volume_roots(paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut sorted: Vec<PathBuf> = paths.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut roots: Vec<PathBuf> = Vec::new();
        for path in sorted {
            if !roots.iter().any(|root| path.starts_with(root)) {
                roots.push(path);
            }
        }
        roots
    }

    fn mount_paths(&self, task: &TaskRun) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = task.work_dir() {
            paths.push(dir.to_path_buf());
        }
        if let Some(bin) = &self.bin_dir {
            paths.push(bin.clone());
        }
        for (_, value) in task.inputs.iter() {
            collect_paths(value, &mut paths);
        }
        Self::volume_roots(&paths)
    }

    /// Render the `batch/v1` Job manifest for one task.
    pub fn render_manifest(&self, task: &TaskRun) -> Result<String> {
        let work_dir = task
            .work_dir()
            .ok_or(ExecutorError::NoWorkDir(task.id))?;
        let name = Self::kube_job_name(task);

        let roots = self.mount_paths(task);
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for (i, root) in roots.iter().enumerate() {
            let vol_name = format!("vol-{}", i + 1);
            volumes.push(Volume {
                name: vol_name.clone(),
                host_path: HostPath {
                    path: root.display().to_string(),
                },
            });
            mounts.push(VolumeMount {
                name: vol_name,
                mount_path: root.display().to_string(),
            });
        }

        let amounts = ResourceAmounts {
            cpu: task.config.cpus,
            memory: task.config.memory.map(|m| m.to_kube_quantity()),
        };
        let manifest = JobManifest {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            metadata: Metadata { name: name.clone() },
            spec: JobSpec {
                backoff_limit: 0,
                template: PodTemplate {
                    spec: PodSpec {
                        restart_policy: "Never".to_string(),
                        containers: vec![Container {
                            name,
                            image: task
                                .config
                                .container
                                .clone()
                                .unwrap_or_else(|| self.image.clone()),
                            command: vec![
                                "bash".to_string(),
                                CMD_RUN.to_string(),
                            ],
                            working_dir: work_dir.display().to_string(),
                            resources: Resources {
                                limits: ResourceAmounts {
                                    cpu: amounts.cpu,
                                    memory: amounts.memory.clone(),
                                },
                                requests: amounts,
                            },
                            volume_mounts: mounts,
                        }],
                        volumes,
                    },
                },
            },
        };
        Ok(serde_yaml::to_string(&manifest)?)
    }
}

fn collect_paths(value: &Value, out: &mut Vec<PathBuf>) {
    match value {
        Value::Path(p) => {
            let parent = p.parent().unwrap_or(Path::new("/"));
            out.push(parent.to_path_buf());
        }
        Value::List(items) => {
            for item in items {
                collect_paths(item, out);
            }
        }
        _ => {}
    }
}

impl GridScheduler for KubeScheduler {
    fn name(&self) -> &'static str {
        "k8s"
    }

    fn directive_token(&self) -> &'static str {
        ""
    }

    fn render_directives(&self, _task: &TaskRun) -> Vec<String> {
        Vec::new()
    }

    fn prepare_submit(&self, task: &TaskRun, paths: &TaskPaths) -> Result<()> {
        let manifest = self.render_manifest(task)?;
        std::fs::write(paths.manifest(), manifest)?;
        Ok(())
    }

    fn submit_command(&self, _task: &TaskRun, paths: &TaskPaths) -> Vec<String> {
        vec![
            "kubectl".to_string(),
            "create".to_string(),
            "-f".to_string(),
            paths.manifest().display().to_string(),
            "-o".to_string(),
            "name".to_string(),
        ]
    }

    fn parse_job_id(&self, stdout: &str) -> Result<String> {
        let re = Regex::new(r"job(?:\.batch)?/(\S+)").expect("valid regex");
        re.captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExecutorError::JobIdParse(stdout.trim().to_string()))
    }

    fn queue_status_command(&self, _queue: Option<&str>, _user: Option<&str>) -> Vec<String> {
        vec![
            "kubectl".to_string(),
            "get".to_string(),
            "pods".to_string(),
            "-a".to_string(),
        ]
    }

    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut map = HashMap::new();
        for line in stdout.lines().skip(1) {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 3 {
                continue;
            }
            // Pod names carry a random suffix behind the owning job name.
            let job = match cols[0].rsplit_once('-') {
                Some((job, _)) => job,
                None => cols[0],
            };
            let status = match cols[2] {
                "Pending" | "ContainerCreating" => QueueStatus::Pending,
                "Running" => QueueStatus::Running,
                "Succeeded" | "Completed" => QueueStatus::Done,
                _ => QueueStatus::Error,
            };
            map.insert(job.to_string(), status);
        }
        map
    }

    fn kill_command(&self, job_id: &str) -> Vec<String> {
        vec![
            "kubectl".to_string(),
            "delete".to_string(),
            "job".to_string(),
            job_id.to_string(),
        ]
    }
}
