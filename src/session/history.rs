// ABOUTME: Line-oriented history file of executed runs
// ABOUTME: Appends, prefix lookups and deletions over tab-separated run entries

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use super::error::{Result, SessionError};

pub const HISTORY_FILE_NAME: &str = ".nextflow.history";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const LOCK_RETRY: Duration = Duration::from_millis(50);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// One recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub run_name: String,
    pub session_id: String,
    pub command_line: String,
}

impl HistoryEntry {
    fn to_line(&self) -> String {
        let timestamp = self
            .timestamp
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();
        format!(
            "{}\t{}\t{}\t{}",
            timestamp, self.run_name, self.session_id, self.command_line
        )
    }

    /// Parse one line. The current form is 4 columns
    /// `timestamp \t runName \t sessionId \t commandLine`; legacy 2-column
    /// lines carried the session id and the command line in either order
    /// and still parse (the uuid-shaped column wins as the session id).
    fn parse(line: &str) -> Option<Self> {
        let cols: Vec<&str> = line.split('\t').collect();
        match cols.len() {
            0 | 1 => None,
            2 | 3 => {
                let (session_id, command_line) = if looks_like_session_id(cols[0]) {
                    (cols[0], cols[cols.len() - 1])
                } else if looks_like_session_id(cols[cols.len() - 1]) {
                    (cols[cols.len() - 1], cols[0])
                } else {
                    return None;
                };
                let run_name = if cols.len() == 3 && !looks_like_session_id(cols[1]) {
                    cols[1]
                } else {
                    ""
                };
                Some(Self {
                    timestamp: None,
                    run_name: run_name.to_string(),
                    session_id: session_id.to_string(),
                    command_line: command_line.to_string(),
                })
            }
            _ => {
                let timestamp = NaiveDateTime::parse_from_str(cols[0], TIMESTAMP_FORMAT)
                    .ok()
                    .map(|naive| naive.and_utc());
                Some(Self {
                    timestamp,
                    run_name: cols[1].to_string(),
                    session_id: cols[2].to_string(),
                    command_line: cols[3..].join("\t"),
                })
            }
        }
    }
}

/// True iff every character is in `[-0-9a-f]`. A single-character token is
/// uuid-shaped as well.
pub fn is_uuid_shaped(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c == '-' || c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Stricter test used only when classifying legacy line columns, where a
/// bare command such as `head` would otherwise be mistaken for an id.
fn looks_like_session_id(token: &str) -> bool {
    token.len() >= 8 && is_uuid_shaped(token)
}

/// The `.nextflow.history` file: UTF-8, LF-terminated, tab-separated.
///
/// Appends and rewrites run under a sibling `.lock` file so concurrent
/// processes do not interleave partial lines.
#[derive(Debug, Clone)]
pub struct HistoryFile {
    path: PathBuf,
}

impl HistoryFile {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(HISTORY_FILE_NAME),
        }
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn append(&self, session_id: &str, run_name: &str, command_line: &str) -> Result<()> {
        let entry = HistoryEntry {
            timestamp: Some(Utc::now()),
            run_name: run_name.to_string(),
            session_id: session_id.to_string(),
            command_line: command_line.to_string(),
        };
        let _lock = FileLock::acquire(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry.to_line())?;
        Ok(())
    }

    /// All entries in file order. Unparseable lines are skipped with a warning.
    pub fn load(&self) -> Result<Vec<HistoryEntry>> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match HistoryEntry::parse(line) {
                Some(entry) => entries.push(entry),
                None => warn!("Skipping malformed history line: {}", line),
            }
        }
        Ok(entries)
    }

    /// Entries whose session id starts with `prefix`, in history order.
    pub fn find_by_id(&self, prefix: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| e.session_id.starts_with(prefix))
            .collect())
    }

    pub fn find_by_name(&self, run_name: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| e.run_name == run_name)
            .collect())
    }

    /// Resolve a selection token: `last` names the final entry, a
    /// uuid-shaped token is a session id prefix, anything else a run name.
    pub fn find_by(&self, token: &str) -> Result<Vec<HistoryEntry>> {
        if token == "last" {
            return Ok(self.load()?.pop().into_iter().collect());
        }
        if is_uuid_shaped(token) {
            self.find_by_id(token)
        } else {
            self.find_by_name(token)
        }
    }

    /// Resolve a token that must name exactly one entry. Two or more
    /// matches produce an error enumerating every candidate id.
    pub fn find_unique(&self, token: &str) -> Result<HistoryEntry> {
        let mut matches = self.find_by(token)?;
        match matches.len() {
            0 => Err(SessionError::UnknownRun(token.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(SessionError::AmbiguousId {
                prefix: token.to_string(),
                ids: matches.into_iter().map(|e| e.session_id).collect(),
            }),
        }
    }

    /// Entries strictly before the (unique) match, in history order.
    pub fn find_before(&self, token: &str) -> Result<Vec<HistoryEntry>> {
        let pivot = self.find_unique(token)?;
        Ok(self
            .load()?
            .into_iter()
            .take_while(|e| !same_entry(e, &pivot))
            .collect())
    }

    /// Entries strictly after the (unique) match, in history order.
    pub fn find_after(&self, token: &str) -> Result<Vec<HistoryEntry>> {
        let pivot = self.find_unique(token)?;
        Ok(self
            .load()?
            .into_iter()
            .skip_while(|e| !same_entry(e, &pivot))
            .skip(1)
            .collect())
    }

    /// Every entry except the (unique) match.
    pub fn find_but(&self, token: &str) -> Result<Vec<HistoryEntry>> {
        let pivot = self.find_unique(token)?;
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| !same_entry(e, &pivot))
            .collect())
    }

    /// Rewrite the file without the given entry.
    pub fn delete_entry(&self, entry: &HistoryEntry) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;
        let remaining: Vec<HistoryEntry> = self
            .load()?
            .into_iter()
            .filter(|e| !same_entry(e, entry))
            .collect();
        let mut content = String::new();
        for e in &remaining {
            content.push_str(&e.to_line());
            content.push('\n');
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

fn same_entry(a: &HistoryEntry, b: &HistoryEntry) -> bool {
    a.session_id == b.session_id && a.run_name == b.run_name
}

/// Advisory lock realized as a sibling `.lock` file created with
/// `create_new`; released on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(target: &Path) -> Result<Self> {
        let path = target.with_extension("lock");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(SessionError::LockTimeout(path));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
