// ABOUTME: Work-dir file layout and the .command.run driver script
// ABOUTME: Materializes user script, staging, environment export and exit capture

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::stage::{shell_escape, stage_script, unstage_script, StagedFile};
use crate::task::{CopyStrategy, TaskContext};

pub const CMD_RUN: &str = ".command.run";
pub const CMD_SCRIPT: &str = ".command.sh";
pub const CMD_OUT: &str = ".command.out";
pub const CMD_ERR: &str = ".command.err";
pub const CMD_LOG: &str = ".command.log";
pub const CMD_ENV: &str = ".command.env";
pub const CMD_EXIT: &str = ".exitcode";
pub const CMD_MANIFEST: &str = ".command.yaml";
pub const CMD_CONTEXT: &str = ".command.context";

/// Resolved paths of the per-task control files.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    dir: PathBuf,
}

impl TaskPaths {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: work_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_script(&self) -> PathBuf {
        self.dir.join(CMD_RUN)
    }

    pub fn user_script(&self) -> PathBuf {
        self.dir.join(CMD_SCRIPT)
    }

    pub fn stdout(&self) -> PathBuf {
        self.dir.join(CMD_OUT)
    }

    pub fn stderr(&self) -> PathBuf {
        self.dir.join(CMD_ERR)
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join(CMD_LOG)
    }

    pub fn env(&self) -> PathBuf {
        self.dir.join(CMD_ENV)
    }

    pub fn exitcode(&self) -> PathBuf {
        self.dir.join(CMD_EXIT)
    }

    pub fn manifest(&self) -> PathBuf {
        self.dir.join(CMD_MANIFEST)
    }

    pub fn context(&self) -> PathBuf {
        self.dir.join(CMD_CONTEXT)
    }

    /// Read the `.exitcode` file left by the driver script.
    pub fn read_exit_status(&self) -> Option<i32> {
        std::fs::read_to_string(self.exitcode())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

/// Assembles the driver (`.command.run`) and user (`.command.sh`) scripts
/// for one task attempt.
#[derive(Debug)]
pub struct TaskLauncher {
    paths: TaskPaths,
    task_name: String,
    script: String,
    headers: Option<String>,
    staged: Vec<StagedFile>,
    unstage_outputs: Vec<String>,
    unstage_dir: Option<PathBuf>,
    copy_strategy: CopyStrategy,
    bin_dir: Option<PathBuf>,
    context: Option<TaskContext>,
}

impl TaskLauncher {
    pub fn new(work_dir: impl Into<PathBuf>, task_name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            paths: TaskPaths::new(work_dir),
            task_name: task_name.into(),
            script: script.into(),
            headers: None,
            staged: Vec::new(),
            unstage_outputs: Vec::new(),
            unstage_dir: None,
            copy_strategy: CopyStrategy::default(),
            bin_dir: None,
            context: None,
        }
    }

    /// Scheduler directive block placed right under the shebang.
    pub fn headers(mut self, headers: Option<String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn staged_files(mut self, files: Vec<StagedFile>) -> Self {
        self.staged = files;
        self
    }

    pub fn unstage(mut self, outputs: Vec<String>, dir: PathBuf, strategy: CopyStrategy) -> Self {
        self.unstage_outputs = outputs;
        self.unstage_dir = Some(dir);
        self.copy_strategy = strategy;
        self
    }

    /// Prepend `<bin>` to `PATH` inside the exported task environment.
    pub fn bin_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.bin_dir = dir.filter(|d| d.is_dir());
        self
    }

    pub fn context(mut self, context: TaskContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn paths(&self) -> &TaskPaths {
        &self.paths
    }

    /// Render the driver script: change into the work dir, stage inputs,
    /// export the environment, run the user script capturing stdout/stderr,
    /// record the exit code, merge the log and unstage outputs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#!/bin/bash\n");
        if let Some(headers) = &self.headers {
            out.push_str(headers);
            out.push('\n');
        }
        out.push_str(&format!("# task: {}\n", self.task_name));
        out.push_str("set -u\n");
        out.push_str(&format!(
            "cd {}\n",
            shell_escape(&self.paths.dir().display().to_string())
        ));

        if let Some(bin) = &self.bin_dir {
            out.push_str(&format!(
                "export PATH={}:$PATH\n",
                shell_escape(&bin.display().to_string())
            ));
        }

        if !self.staged.is_empty() {
            out.push_str(&stage_script(&self.staged));
            out.push('\n');
        }

        // Context entries become shell variables for the user script.
        if let Some(context) = &self.context {
            for (name, value) in context.iter() {
                if is_shell_identifier(name) {
                    out.push_str(&format!("export {}={}\n", name, quote_single(&value.render())));
                }
            }
        }

        out.push_str(&format!("env > {}\n", CMD_ENV));
        out.push_str(&format!(
            "bash {} > {} 2> {}\n",
            CMD_SCRIPT, CMD_OUT, CMD_ERR
        ));
        out.push_str("status=$?\n");
        out.push_str(&format!("echo $status > {}\n", CMD_EXIT));
        out.push_str(&format!(
            "cat {} {} > {} 2>/dev/null || true\n",
            CMD_OUT, CMD_ERR, CMD_LOG
        ));

        if let Some(dir) = &self.unstage_dir {
            let section = unstage_script(&self.unstage_outputs, dir, self.copy_strategy);
            if !section.is_empty() {
                out.push_str(&section);
                out.push('\n');
            }
        }

        out.push_str("exit $status\n");
        out
    }

    /// Write the work-dir files: `.command.run` (executable), `.command.sh`
    /// and, when present, the serialized `.command.context`.
    pub fn write(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(self.paths.dir())?;

        std::fs::write(self.paths.user_script(), &self.script)?;

        let run_path = self.paths.run_script();
        std::fs::write(&run_path, self.render())?;
        let mut perms = std::fs::metadata(&run_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&run_path, perms)?;

        if let Some(context) = &self.context {
            let bytes = context
                .to_bytes()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(self.paths.context(), bytes)?;
        }

        Ok(run_path)
    }
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Single-quote a value for the shell, closing around embedded quotes.
fn quote_single(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Value;
    use tempfile::TempDir;

    #[test]
    fn test_render_contains_sections_in_order() {
        let launcher = TaskLauncher::new("/work/ab/cdef", "align (1)", "echo hi")
            .staged_files(vec![StagedFile::new("/data/in.fa", "in.fa")])
            .unstage(
                vec!["out.bam".to_string()],
                PathBuf::from("/results"),
                CopyStrategy::Copy,
            );

        let script = launcher.render();
        let stage_pos = script.find("ln -s /data/in.fa in.fa").unwrap();
        let env_pos = script.find("env > .command.env").unwrap();
        let run_pos = script
            .find("bash .command.sh > .command.out 2> .command.err")
            .unwrap();
        let exit_pos = script.find("echo $status > .exitcode").unwrap();
        let unstage_pos = script.find("cp -fR out.bam /results || true").unwrap();

        assert!(stage_pos < env_pos);
        assert!(env_pos < run_pos);
        assert!(run_pos < exit_pos);
        assert!(exit_pos < unstage_pos);
    }

    #[test]
    fn test_write_creates_files_and_permissions() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("ab").join("cdef");
        let mut context = TaskContext::new();
        context.set("x", Value::Int(1));

        let launcher =
            TaskLauncher::new(&work, "align (1)", "echo hi").context(context.clone());
        let run_path = launcher.write().unwrap();

        assert!(run_path.is_file());
        assert_eq!(
            std::fs::read_to_string(work.join(CMD_SCRIPT)).unwrap(),
            "echo hi"
        );
        let mode = std::fs::metadata(&run_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);

        let restored =
            TaskContext::from_bytes(&std::fs::read(work.join(CMD_CONTEXT)).unwrap()).unwrap();
        assert_eq!(restored, context);
    }

    #[test]
    fn test_context_exported_as_shell_variables() {
        let mut context = TaskContext::new();
        context.set("sample", Value::str("it's one"));
        context.set("count", Value::Int(3));
        context.set("not valid", Value::Int(1));

        let script = TaskLauncher::new("/work/x", "t", "true")
            .context(context)
            .render();
        assert!(script.contains("export sample='it'\\''s one'"));
        assert!(script.contains("export count='3'"));
        assert!(!script.contains("not valid"));
    }

    #[test]
    fn test_exit_status_read_back() {
        let dir = TempDir::new().unwrap();
        let paths = TaskPaths::new(dir.path());
        assert_eq!(paths.read_exit_status(), None);
        std::fs::write(paths.exitcode(), "143\n").unwrap();
        assert_eq!(paths.read_exit_status(), Some(143));
    }

    #[test]
    fn test_bin_dir_prepends_path() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();

        let launcher =
            TaskLauncher::new("/work/x", "t", "true").bin_dir(Some(bin.clone()));
        assert!(launcher
            .render()
            .contains(&format!("export PATH={}:$PATH", bin.display())));

        let skipped = TaskLauncher::new("/work/x", "t", "true")
            .bin_dir(Some(dir.path().join("missing")));
        assert!(!skipped.render().contains("export PATH"));
    }
}
