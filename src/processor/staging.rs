// ABOUTME: File input normalization and wildcard expansion
// ABOUTME: Materializes values as staged files and resolves name patterns to target names

use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::script::StagedFile;
use crate::task::Value;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Name pattern '{0}' with '?' wildcards requires multiple values")]
    SingleValueQuestionMark(String),

    #[error("Cannot stage null value for input '{0}'")]
    NullValue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, StagingError>;

/// Normalize one file input into its staged file list.
///
/// Values that are not already paths are materialized as files under
/// `scratch` (their textual rendering written out); each value then gets a
/// target name derived from the declared name pattern.
pub fn normalize_file_input(
    input_name: &str,
    pattern: &str,
    value: &Value,
    scratch: &Path,
) -> Result<Vec<StagedFile>> {
    let items = value.clone().into_items();
    let count = items.len();

    let mut staged = Vec::with_capacity(count);
    for (k, item) in items.into_iter().enumerate() {
        let source = match item {
            Value::Path(p) => p,
            Value::Null => return Err(StagingError::NullValue(input_name.to_string())),
            other => materialize(input_name, k, &other, scratch)?,
        };
        let orig_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.{}", input_name, k + 1));
        let target = expand_name(pattern, &orig_name, k + 1, count)?;
        staged.push(StagedFile::new(source, target));
    }
    Ok(staged)
}

/// Write a non-path value to a scratch file so it can be staged by name.
fn materialize(
    input_name: &str,
    index: usize,
    value: &Value,
    scratch: &Path,
) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(scratch)?;
    let path = scratch.join(format!("{}.{}", input_name, index + 1));
    let mut file = std::fs::File::create(&path)?;
    file.write_all(value.render().as_bytes())?;
    Ok(path)
}

/// Resolve the declared name pattern for the `ordinal`-th of `count` values.
fn expand_name(pattern: &str, orig_name: &str, ordinal: usize, count: usize) -> Result<String> {
    // Keep the original name for an absent or catch-all pattern.
    if pattern.is_empty() || pattern == "*" {
        return Ok(orig_name.to_string());
    }
    // A trailing `/*` stages the original names below a directory.
    if let Some(dir) = pattern.strip_suffix("/*") {
        return Ok(format!("{}/{}", dir, orig_name));
    }
    // `?` runs expand to a zero-padded ordinal; a single value is an error.
    if pattern.contains('?') {
        if count < 2 {
            return Err(StagingError::SingleValueQuestionMark(pattern.to_string()));
        }
        return Ok(replace_question_runs(pattern, ordinal));
    }
    if pattern.contains('*') {
        return Ok(if count < 2 {
            pattern.replace('*', "")
        } else {
            pattern.replace('*', &ordinal.to_string())
        });
    }
    // No wildcard: the name is used as-is for one value, and behaves like
    // `name*` when the input carries several.
    if count < 2 {
        Ok(pattern.to_string())
    } else {
        Ok(format!("{}{}", pattern, ordinal))
    }
}

fn replace_question_runs(pattern: &str, ordinal: usize) -> String {
    let mut out = String::with_capacity(pattern.len());
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '?' {
            let mut width = 0;
            while i < chars.len() && chars[i] == '?' {
                width += 1;
                i += 1;
            }
            out.push_str(&format!("{:0width$}", ordinal, width = width));
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}
