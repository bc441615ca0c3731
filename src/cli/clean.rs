// ABOUTME: The clean command removing cached work dirs, entries and history lines
// ABOUTME: Honors dry-run reporting, reference counts and whole-session cache removal

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use super::log::select_entries;
use crate::cache::Cache;
use crate::session::{HistoryEntry, HistoryFile};

#[allow(clippy::too_many_arguments)]
pub async fn run_clean(
    base_dir: &Path,
    run: Option<String>,
    dry_run: bool,
    force: bool,
    quiet: bool,
    before: Option<String>,
    after: Option<String>,
    but: Option<String>,
) -> Result<()> {
    if !dry_run && !force {
        return Err(anyhow!(
            "Refusing to delete anything: specify -n to preview or -f to force"
        ));
    }

    let history = HistoryFile::new(base_dir);
    let selection = select_entries(
        &history,
        run.as_deref(),
        before.as_deref(),
        after.as_deref(),
        but.as_deref(),
    )?;
    let entries =
        selection.ok_or_else(|| anyhow!("Specify a run name, a session id or a selection option"))?;

    for entry in entries {
        clean_entry(base_dir, &history, &entry, dry_run, quiet)?;
    }
    Ok(())
}

fn clean_entry(
    base_dir: &Path,
    history: &HistoryFile,
    entry: &HistoryEntry,
    dry_run: bool,
    quiet: bool,
) -> Result<()> {
    let session_id: Uuid = entry
        .session_id
        .parse()
        .with_context(|| format!("malformed session id '{}'", entry.session_id))?;

    let cache = if dry_run {
        Cache::open_for_read(base_dir, session_id, &entry.run_name)
    } else {
        Cache::open_for_modify(base_dir, session_id, &entry.run_name)
    }
    .with_context(|| format!("cannot open cache of run '{}'", entry.run_name))?;

    cache.each_record(|hash, cache_entry, _| {
        let folder = cache_entry.trace.folder().map(str::to_string);
        if dry_run {
            if !quiet {
                match (&folder, cache_entry.ref_count) {
                    (Some(folder), 1) => println!("Would remove {}", folder),
                    (Some(folder), n) => {
                        println!("Would not remove {} (shared by {} runs)", folder, n)
                    }
                    (None, _) => println!("Would remove entry {}", hash),
                }
            }
            return;
        }

        match cache.dec_entry(hash) {
            Ok(Some(0)) | Ok(None) => {
                if let Some(folder) = &folder {
                    match std::fs::remove_dir_all(folder) {
                        Ok(()) => {
                            if !quiet {
                                println!("Removed {}", folder);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            debug!("Work dir {} already gone", folder);
                        }
                        Err(e) => warn!("Cannot remove {}: {}", folder, e),
                    }
                }
            }
            Ok(Some(remaining)) => {
                if !quiet {
                    if let Some(folder) = &folder {
                        println!("Kept {} (still referenced by {} runs)", folder, remaining);
                    }
                }
            }
            Err(e) => warn!("Cannot update cache entry {}: {}", hash, e),
        }
    })?;

    if dry_run {
        return Ok(());
    }

    cache.drop_index()?;
    history.delete_entry(entry)?;

    // The whole per-session cache goes once no other run shares the id.
    let shares_session = history
        .load()?
        .iter()
        .any(|e| e.session_id == entry.session_id);
    if !shares_session {
        cache.drop_all()?;
        debug!("Removed cache directory for session {}", entry.session_id);
    }
    Ok(())
}
