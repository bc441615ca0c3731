// ABOUTME: Materialized task configuration and directive value types
// ABOUTME: Parses and renders memory, wall-time, and error-strategy directives

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Result, TaskError};

const KIBI: u64 = 1024;
const MEBI: u64 = KIBI * 1024;
const GIBI: u64 = MEBI * 1024;
const TEBI: u64 = GIBI * 1024;

/// A memory amount parsed from directive strings such as `200M`, `4GB`
/// or `512 KB`. Stored as bytes; unit suffixes are binary multiples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryUnit {
    bytes: u64,
}

impl MemoryUnit {
    pub fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whole mebibytes, as consumed by `--mem` style scheduler options.
    pub fn mega(&self) -> u64 {
        self.bytes / MEBI
    }

    pub fn giga(&self) -> u64 {
        self.bytes / GIBI
    }

    /// Kubernetes resource quantity, e.g. `4096Mi`.
    pub fn to_kube_quantity(&self) -> String {
        format!("{}Mi", self.mega())
    }
}

impl FromStr for MemoryUnit {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let (num, unit) = trimmed.split_at(split);
        let amount: f64 = num
            .trim()
            .parse()
            .map_err(|_| TaskError::InvalidMemoryUnit(s.to_string()))?;
        let scale = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" => KIBI,
            "M" | "MB" => MEBI,
            "G" | "GB" => GIBI,
            "T" | "TB" => TEBI,
            _ => return Err(TaskError::InvalidMemoryUnit(s.to_string())),
        };
        Ok(Self {
            bytes: (amount * scale as f64) as u64,
        })
    }
}

impl fmt::Display for MemoryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes >= GIBI && self.bytes % GIBI == 0 {
            write!(f, "{} GB", self.bytes / GIBI)
        } else if self.bytes >= MEBI && self.bytes % MEBI == 0 {
            write!(f, "{} MB", self.bytes / MEBI)
        } else if self.bytes >= KIBI && self.bytes % KIBI == 0 {
            write!(f, "{} KB", self.bytes / KIBI)
        } else {
            write!(f, "{} B", self.bytes)
        }
    }
}

/// A wall-clock limit parsed from directive strings such as `2h`, `30m`,
/// `90s` or compound forms like `1d 6h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WallTime {
    seconds: u64,
}

impl WallTime {
    pub fn from_seconds(seconds: u64) -> Self {
        Self { seconds }
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn minutes(&self) -> u64 {
        self.seconds / 60
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }

    /// Render as `HH:MM:SS`, the form consumed by `#SBATCH -t`.
    pub fn to_hms(&self) -> String {
        format!(
            "{:02}:{:02}:{:02}",
            self.seconds / 3600,
            (self.seconds % 3600) / 60,
            self.seconds % 60
        )
    }
}

impl FromStr for WallTime {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        let mut total: u64 = 0;
        let mut seen = false;
        for token in s.split_whitespace() {
            let split = token
                .find(|c: char| c.is_ascii_alphabetic())
                .unwrap_or(token.len());
            let (num, unit) = token.split_at(split);
            let amount: u64 = num
                .parse()
                .map_err(|_| TaskError::InvalidDuration(s.to_string()))?;
            let scale = match unit.to_ascii_lowercase().as_str() {
                "s" | "sec" | "" => 1,
                "m" | "min" => 60,
                "h" | "hour" | "hours" => 3600,
                "d" | "day" | "days" => 86_400,
                _ => return Err(TaskError::InvalidDuration(s.to_string())),
            };
            total += amount * scale;
            seen = true;
        }
        if !seen {
            return Err(TaskError::InvalidDuration(s.to_string()));
        }
        Ok(Self { seconds: total })
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hms())
    }
}

/// Per-process reaction to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    #[default]
    Terminate,
    Finish,
    Ignore,
    Retry,
}

impl FromStr for ErrorStrategy {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "terminate" => Ok(ErrorStrategy::Terminate),
            "finish" => Ok(ErrorStrategy::Finish),
            "ignore" => Ok(ErrorStrategy::Ignore),
            "retry" => Ok(ErrorStrategy::Retry),
            _ => Err(TaskError::InvalidErrorStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorStrategy::Terminate => "terminate",
            ErrorStrategy::Finish => "finish",
            ErrorStrategy::Ignore => "ignore",
            ErrorStrategy::Retry => "retry",
        };
        write!(f, "{}", name)
    }
}

/// How file inputs contribute to the task fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// Hash `(size, last-modified, path)` per file.
    #[default]
    Standard,
    /// Hash file content byte-wise.
    Deep,
}

impl FromStr for HashMode {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(HashMode::Standard),
            "deep" => Ok(HashMode::Deep),
            _ => Err(TaskError::InvalidHashMode(s.to_string())),
        }
    }
}

/// Strategy used by the unstage script to move outputs out of the work dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStrategy {
    #[default]
    Copy,
    Move,
    Rsync,
}

impl CopyStrategy {
    pub fn command(&self) -> &'static str {
        match self {
            CopyStrategy::Copy => "cp -fR",
            CopyStrategy::Move => "mv -f",
            CopyStrategy::Rsync => "rsync -rRl",
        }
    }
}

/// The directive values materialized for one task attempt.
///
/// Directive defaults follow the process configuration; `attempt` starts at 1
/// and is bumped for every retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default)]
    pub memory: Option<MemoryUnit>,
    #[serde(default)]
    pub time: Option<WallTime>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub cluster_options: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_errors")]
    pub max_errors: i64,
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    #[serde(default)]
    pub stage_mode: CopyStrategy,
    #[serde(default)]
    pub hash_mode: HashMode,
    #[serde(default = "default_valid_exit_codes")]
    pub valid_exit_codes: Vec<i32>,
}

fn default_cpus() -> u32 {
    1
}

fn default_attempt() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    1
}

fn default_max_errors() -> i64 {
    -1
}

fn default_valid_exit_codes() -> Vec<i32> {
    vec![0]
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory: None,
            time: None,
            queue: None,
            cluster_options: None,
            container: None,
            attempt: default_attempt(),
            error_strategy: ErrorStrategy::default(),
            max_retries: default_max_retries(),
            max_errors: default_max_errors(),
            store_dir: None,
            stage_mode: CopyStrategy::default(),
            hash_mode: HashMode::default(),
            valid_exit_codes: default_valid_exit_codes(),
        }
    }
}

impl TaskConfig {
    pub fn is_valid_exit(&self, code: i32) -> bool {
        self.valid_exit_codes.contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_parsing() {
        assert_eq!("200M".parse::<MemoryUnit>().unwrap().mega(), 200);
        assert_eq!("4GB".parse::<MemoryUnit>().unwrap().mega(), 4096);
        assert_eq!("512 KB".parse::<MemoryUnit>().unwrap().bytes(), 512 * 1024);
        assert_eq!("1024".parse::<MemoryUnit>().unwrap().bytes(), 1024);
        assert!("many".parse::<MemoryUnit>().is_err());
        assert!("4X".parse::<MemoryUnit>().is_err());
    }

    #[test]
    fn test_memory_kube_quantity() {
        let mem = "4GB".parse::<MemoryUnit>().unwrap();
        assert_eq!(mem.to_kube_quantity(), "4096Mi");
    }

    #[test]
    fn test_walltime_parsing() {
        assert_eq!("2h".parse::<WallTime>().unwrap().to_hms(), "02:00:00");
        assert_eq!("90s".parse::<WallTime>().unwrap().seconds(), 90);
        assert_eq!("30m".parse::<WallTime>().unwrap().minutes(), 30);
        assert_eq!(
            "1d 6h".parse::<WallTime>().unwrap().seconds(),
            86_400 + 6 * 3600
        );
        assert!("soon".parse::<WallTime>().is_err());
    }

    #[test]
    fn test_error_strategy_parsing() {
        assert_eq!(
            "retry".parse::<ErrorStrategy>().unwrap(),
            ErrorStrategy::Retry
        );
        assert_eq!(
            "TERMINATE".parse::<ErrorStrategy>().unwrap(),
            ErrorStrategy::Terminate
        );
        assert!("explode".parse::<ErrorStrategy>().is_err());
    }

    #[test]
    fn test_copy_strategy_commands() {
        assert_eq!(CopyStrategy::Copy.command(), "cp -fR");
        assert_eq!(CopyStrategy::Move.command(), "mv -f");
        assert_eq!(CopyStrategy::Rsync.command(), "rsync -rRl");
    }

    #[test]
    fn test_config_defaults() {
        let config = TaskConfig::default();
        assert_eq!(config.cpus, 1);
        assert_eq!(config.attempt, 1);
        assert_eq!(config.max_errors, -1);
        assert_eq!(config.error_strategy, ErrorStrategy::Terminate);
        assert!(config.is_valid_exit(0));
        assert!(!config.is_valid_exit(1));
    }
}
