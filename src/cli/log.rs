// ABOUTME: The log and history commands over cached runs
// ABOUTME: Resolves history selections and prints per-task records with fields, templates and filters

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use handlebars::Handlebars;
use tracing::warn;
use uuid::Uuid;

use super::filter::Filter;
use crate::cache::{Cache, TraceRecord};
use crate::script::TaskPaths;
use crate::session::{HistoryEntry, HistoryFile};

pub const DEFAULT_FIELDS: &str = "folder";
const SPECIAL_KEYS: [&str; 4] = ["stdout", "stderr", "log", "env"];

/// Resolve the run selection shared by `log` and `clean`. Returns `None`
/// when nothing was selected at all.
pub fn select_entries(
    history: &HistoryFile,
    run: Option<&str>,
    before: Option<&str>,
    after: Option<&str>,
    but: Option<&str>,
) -> Result<Option<Vec<HistoryEntry>>> {
    let entries = if let Some(token) = before {
        Some(history.find_before(token)?)
    } else if let Some(token) = after {
        Some(history.find_after(token)?)
    } else if let Some(token) = but {
        Some(history.find_but(token)?)
    } else if let Some(token) = run {
        let matches = history.find_by(token)?;
        if matches.is_empty() {
            return Err(anyhow!("No run found for '{}'", token));
        }
        Some(matches)
    } else {
        None
    };
    Ok(entries)
}

#[allow(clippy::too_many_arguments)]
pub async fn run_log(
    base_dir: &Path,
    run: Option<String>,
    separator: String,
    fields: Option<String>,
    template: Option<String>,
    list_lines: usize,
    filter: Option<String>,
    before: Option<String>,
    after: Option<String>,
    but: Option<String>,
) -> Result<()> {
    let history = HistoryFile::new(base_dir);
    let selection = select_entries(
        &history,
        run.as_deref(),
        before.as_deref(),
        after.as_deref(),
        but.as_deref(),
    )?;

    let Some(entries) = selection else {
        // With no selection the history itself is the listing.
        print_history(&history)?;
        return Ok(());
    };

    let filter = filter
        .as_deref()
        .map(Filter::compile)
        .transpose()
        .context("invalid -F filter expression")?;

    let mut registry = Handlebars::new();
    registry.set_strict_mode(false);
    if let Some(tpl) = &template {
        registry
            .register_template_string("record", tpl)
            .context("invalid -t template")?;
    }
    let field_list: Vec<String> = fields
        .as_deref()
        .unwrap_or(DEFAULT_FIELDS)
        .split(',')
        .map(|f| f.trim().to_string())
        .collect();

    for entry in entries {
        let session_id: Uuid = match entry.session_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("Skipping malformed session id '{}'", entry.session_id);
                continue;
            }
        };
        let cache = Cache::open_for_read(base_dir, session_id, &entry.run_name)
            .with_context(|| format!("cannot read cache of run '{}'", entry.run_name))?;

        cache.each_record(|_, cache_entry, _| {
            let trace = &cache_entry.trace;
            let lookup = |name: &str| lookup_field(trace, name, list_lines);

            if let Some(filter) = &filter {
                if !filter.matches(&lookup) {
                    return;
                }
            }

            if let Some(tpl) = &template {
                match render_template(&registry, tpl, trace, list_lines) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Template rendering failed: {}", e),
                }
            } else {
                let line: Vec<String> = field_list
                    .iter()
                    .map(|field| lookup(field).unwrap_or_else(|| "-".to_string()))
                    .collect();
                println!("{}", line.join(&separator));
            }
        })?;
    }
    Ok(())
}

pub fn run_history(base_dir: &Path) -> Result<()> {
    print_history(&HistoryFile::new(base_dir))
}

fn print_history(history: &HistoryFile) -> Result<()> {
    for entry in history.load()? {
        let timestamp = entry
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{}",
            timestamp, entry.run_name, entry.session_id, entry.command_line
        );
    }
    Ok(())
}

/// Field lookup over a trace record. The stdout, stderr, log and env keys
/// lazily fetch the leading lines of the matching work-dir file.
fn lookup_field(trace: &TraceRecord, name: &str, list_lines: usize) -> Option<String> {
    if SPECIAL_KEYS.contains(&name) {
        let folder = trace.folder()?;
        return fetch_task_file(Path::new(folder), name, list_lines);
    }
    trace.get(name).map(|v| v.to_string())
}

fn fetch_task_file(folder: &Path, key: &str, list_lines: usize) -> Option<String> {
    let paths = TaskPaths::new(folder);
    let path = match key {
        "stdout" => paths.stdout(),
        "stderr" => paths.stderr(),
        "log" => paths.log(),
        "env" => paths.env(),
        _ => return None,
    };
    let content = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().take(list_lines).collect();
    Some(lines.join("\n"))
}

fn render_template(
    registry: &Handlebars,
    template: &str,
    trace: &TraceRecord,
    list_lines: usize,
) -> Result<String> {
    let mut data = serde_json::Map::new();
    for (name, value) in trace.iter() {
        data.insert(name.clone(), serde_json::Value::String(value.to_string()));
    }
    // Only fetch the expensive file-backed keys when the template names them.
    for key in SPECIAL_KEYS {
        if template.contains(key) {
            if let Some(text) = lookup_field(trace, key, list_lines) {
                data.insert(key.to_string(), serde_json::Value::String(text));
            }
        }
    }
    Ok(registry.render("record", &serde_json::Value::Object(data))?)
}
