// ABOUTME: Output collection from completed task work dirs
// ABOUTME: Resolves stdout, file-pattern and value outputs plus channel binding modes

use std::path::Path;

use globset::{Glob, GlobSetBuilder};
use indexmap::IndexMap;
use walkdir::WalkDir;

use super::config::{BindMode, FileType, OutputDecl, OutputKind, WalkOptions};
use super::error::TaskFailure;
use super::forward::cartesian;
use crate::script::TaskPaths;
use crate::task::{TaskContext, Value};

type Result<T> = std::result::Result<T, TaskFailure>;

/// Collect every declared output of a completed task. Nothing is bound to
/// channels until all declarations resolved.
pub fn collect_outputs(
    decls: &[OutputDecl],
    work_dir: &Path,
    context: &TaskContext,
    staged_names: &[String],
    is_script: bool,
) -> Result<IndexMap<String, Value>> {
    let mut collected = IndexMap::with_capacity(decls.len());
    for decl in decls {
        let value = match &decl.kind {
            OutputKind::Stdout => collect_stdout(work_dir, is_script)?,
            OutputKind::File {
                pattern,
                options,
                include_inputs,
            } => collect_files(work_dir, pattern, options, *include_inputs, staged_names)?,
            OutputKind::Value(name) => context
                .get(name)
                .cloned()
                .ok_or_else(|| TaskFailure::MissingValue(name.clone()))?,
        };
        collected.insert(decl.name.clone(), value);
    }
    Ok(collected)
}

fn collect_stdout(work_dir: &Path, is_script: bool) -> Result<Value> {
    let paths = TaskPaths::new(work_dir);
    match std::fs::read_to_string(paths.stdout()) {
        Ok(content) => Ok(Value::Str(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if is_script {
                Err(TaskFailure::MissingOutput("stdout".to_string()))
            } else {
                Ok(Value::Str(String::new()))
            }
        }
        Err(e) => Err(TaskFailure::Abort(e.to_string())),
    }
}

fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn collect_files(
    work_dir: &Path,
    pattern: &str,
    options: &WalkOptions,
    include_inputs: bool,
    staged_names: &[String],
) -> Result<Value> {
    let mut matches = if is_glob_pattern(pattern) {
        walk_matches(work_dir, pattern, options)?
    } else {
        let direct = work_dir.join(pattern);
        if direct.exists() {
            vec![direct]
        } else {
            Vec::new()
        }
    };

    if !include_inputs {
        let staged_basenames: Vec<&str> = staged_names
            .iter()
            .filter_map(|n| n.rsplit('/').next())
            .collect();
        matches.retain(|path| {
            path.file_name()
                .map(|name| !staged_basenames.contains(&name.to_string_lossy().as_ref()))
                .unwrap_or(true)
        });
    }

    if matches.is_empty() {
        return Err(TaskFailure::MissingOutput(pattern.to_string()));
    }

    matches.sort();
    if matches.len() == 1 {
        Ok(Value::Path(matches.remove(0)))
    } else {
        Ok(Value::List(matches.into_iter().map(Value::Path).collect()))
    }
}

fn walk_matches(
    work_dir: &Path,
    pattern: &str,
    options: &WalkOptions,
) -> Result<Vec<std::path::PathBuf>> {
    let glob = Glob::new(pattern)
        .map_err(|e| TaskFailure::NotRecoverable(format!("bad output pattern '{}': {}", pattern, e)))?;
    let mut builder = GlobSetBuilder::new();
    builder.add(glob);
    let set = builder
        .build()
        .map_err(|e| TaskFailure::NotRecoverable(e.to_string()))?;

    let mut walker = WalkDir::new(work_dir)
        .min_depth(1)
        .follow_links(options.follow_links);
    if let Some(depth) = options.max_depth {
        walker = walker.max_depth(depth);
    }

    let mut matches = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let relative = match entry.path().strip_prefix(work_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let basename = entry.file_name().to_string_lossy();
        if !options.hidden && basename.starts_with('.') {
            continue;
        }
        let type_ok = match options.file_type {
            FileType::Any => true,
            FileType::Files => entry.file_type().is_file(),
            FileType::Dirs => entry.file_type().is_dir(),
        };
        if type_ok && set.is_match(relative) {
            matches.push(entry.into_path());
        }
    }
    Ok(matches)
}

/// Expand a collected value for channel emission under the declared mode.
pub fn expand_for_binding(value: &Value, mode: BindMode) -> Vec<Value> {
    match mode {
        BindMode::Standard => vec![value.clone()],
        BindMode::Flatten => {
            let mut leaves = Vec::new();
            value.flatten_into(&mut leaves);
            leaves
        }
        BindMode::Combine => match value {
            Value::List(groups) => {
                let groups: Vec<Vec<Value>> =
                    groups.iter().map(|g| g.clone().into_items()).collect();
                cartesian(&groups)
                    .into_iter()
                    .map(Value::List)
                    .collect()
            }
            other => vec![other.clone()],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::CMD_OUT;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, "x").unwrap();
    }

    #[test]
    fn test_stdout_collection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CMD_OUT), "hello\n").unwrap();

        let decls = vec![OutputDecl::stdout("out")];
        let collected =
            collect_outputs(&decls, dir.path(), &TaskContext::new(), &[], true).unwrap();
        assert_eq!(collected.get("out"), Some(&Value::Str("hello\n".into())));
    }

    #[test]
    fn test_missing_stdout_fails_script_tasks_only() {
        let dir = TempDir::new().unwrap();
        let decls = vec![OutputDecl::stdout("out")];

        let err = collect_outputs(&decls, dir.path(), &TaskContext::new(), &[], true);
        assert!(matches!(err, Err(TaskFailure::MissingOutput(_))));

        let ok = collect_outputs(&decls, dir.path(), &TaskContext::new(), &[], false).unwrap();
        assert_eq!(ok.get("out"), Some(&Value::Str(String::new())));
    }

    #[test]
    fn test_glob_file_collection_excludes_hidden() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.bam");
        touch(dir.path(), "b.bam");
        touch(dir.path(), ".hidden.bam");

        let decls = vec![OutputDecl::file("bams", "*.bam")];
        let collected =
            collect_outputs(&decls, dir.path(), &TaskContext::new(), &[], true).unwrap();
        match collected.get("bams").unwrap() {
            Value::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_file_collection() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "result.txt");

        let decls = vec![OutputDecl::file("r", "result.txt")];
        let collected =
            collect_outputs(&decls, dir.path(), &TaskContext::new(), &[], true).unwrap();
        assert!(matches!(collected.get("r"), Some(Value::Path(_))));
    }

    #[test]
    fn test_staged_inputs_are_excluded() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "input.fa");
        touch(dir.path(), "output.fa");

        let decls = vec![OutputDecl::file("fa", "*.fa")];
        let staged = vec!["input.fa".to_string()];
        let collected =
            collect_outputs(&decls, dir.path(), &TaskContext::new(), &staged, true).unwrap();
        match collected.get("fa").unwrap() {
            Value::Path(p) => assert!(p.ends_with("output.fa")),
            other => panic!("expected single path, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_match_is_missing_output() {
        let dir = TempDir::new().unwrap();
        let decls = vec![OutputDecl::file("fa", "*.fa")];
        let err = collect_outputs(&decls, dir.path(), &TaskContext::new(), &[], true);
        assert!(matches!(err, Err(TaskFailure::MissingOutput(p)) if p == "*.fa"));
    }

    #[test]
    fn test_value_output_from_context() {
        let dir = TempDir::new().unwrap();
        let mut context = TaskContext::new();
        context.set("sample", Value::str("s1"));

        let decls = vec![OutputDecl::value("out", "sample")];
        let collected = collect_outputs(&decls, dir.path(), &context, &[], true).unwrap();
        assert_eq!(collected.get("out"), Some(&Value::str("s1")));

        let missing = vec![OutputDecl::value("out", "nope")];
        assert!(matches!(
            collect_outputs(&missing, dir.path(), &context, &[], true),
            Err(TaskFailure::MissingValue(_))
        ));
    }

    #[test]
    fn test_max_depth_honored() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "top.txt");
        touch(dir.path(), "sub/deep.txt");

        let mut decl = OutputDecl::file("t", "**/*.txt");
        if let OutputKind::File { options, .. } = &mut decl.kind {
            options.max_depth = Some(1);
        }
        let collected =
            collect_outputs(&[decl], dir.path(), &TaskContext::new(), &[], true).unwrap();
        match collected.get("t").unwrap() {
            Value::Path(p) => assert!(p.ends_with("top.txt")),
            other => panic!("expected single path, got {:?}", other),
        }
    }

    #[test]
    fn test_binding_modes() {
        let nested = Value::List(vec![
            Value::List(vec![Value::Int(1), Value::Int(2)]),
            Value::Int(3),
        ]);

        assert_eq!(expand_for_binding(&nested, BindMode::Standard).len(), 1);

        let flat = expand_for_binding(&nested, BindMode::Flatten);
        assert_eq!(flat, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

        let combos = expand_for_binding(&nested, BindMode::Combine);
        assert_eq!(
            combos,
            vec![
                Value::List(vec![Value::Int(1), Value::Int(3)]),
                Value::List(vec![Value::Int(2), Value::Int(3)]),
            ]
        );
    }
}
