// ABOUTME: Process configuration: declared inputs, outputs and directives
// ABOUTME: Defines parameter kinds, output binding modes and the when guard seam

use crate::task::{TaskConfig, TaskContext, Value};

/// Guard evaluated against the task context before submission. Returning
/// `Ok(false)` skips the task; an error is terminal for the task only.
pub type WhenGuard = fn(&TaskContext) -> std::result::Result<bool, String>;

/// How an input parameter binds its channel value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputKind {
    /// Bind the value by name into the context.
    Val,
    /// Stage the value as file(s) under the given name pattern.
    File(String),
    /// Iterable-expanding input: every binding multiplies over its items.
    Each,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputDecl {
    pub name: String,
    pub kind: InputKind,
    /// A scalar channel delivers exactly one value; a processor whose
    /// inputs are all scalar stops after its first binding.
    pub scalar: bool,
}

impl InputDecl {
    pub fn val(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::Val,
            scalar: false,
        }
    }

    pub fn file(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::File(pattern.into()),
            scalar: false,
        }
    }

    pub fn each(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::Each,
            scalar: false,
        }
    }

    pub fn scalar(mut self) -> Self {
        self.scalar = true;
        self
    }

    pub fn is_each(&self) -> bool {
        matches!(self.kind, InputKind::Each)
    }
}

/// Directory-walk options honored when collecting `file(pattern)` outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkOptions {
    pub hidden: bool,
    pub follow_links: bool,
    pub max_depth: Option<usize>,
    pub file_type: FileType,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            hidden: false,
            follow_links: false,
            max_depth: None,
            file_type: FileType::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Any,
    Files,
    Dirs,
}

/// What an output parameter produces.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    /// The captured stdout of the task.
    Stdout,
    /// Files matched below the work dir.
    File {
        pattern: String,
        options: WalkOptions,
        /// When false, entries whose basename matches a staged input are
        /// removed from the match set.
        include_inputs: bool,
    },
    /// A named value resolved from the task context.
    Value(String),
}

/// How collected output values are emitted to the downstream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    #[default]
    Standard,
    /// Recursively flatten and emit each leaf.
    Flatten,
    /// Cartesian product over the declared tuple, one item per combination.
    Combine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDecl {
    pub name: String,
    pub kind: OutputKind,
    pub mode: BindMode,
}

impl OutputDecl {
    pub fn stdout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Stdout,
            mode: BindMode::Standard,
        }
    }

    pub fn file(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::File {
                pattern: pattern.into(),
                options: WalkOptions::default(),
                include_inputs: false,
            },
            mode: BindMode::Standard,
        }
    }

    pub fn value(name: impl Into<String>, context_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Value(context_name.into()),
            mode: BindMode::Standard,
        }
    }

    pub fn mode(mut self, mode: BindMode) -> Self {
        self.mode = mode;
        self
    }
}

/// The full configuration of one process: parameters, directives, executor
/// selection, the optional guard and the free variables its body references
/// from the enclosing script binding.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub name: String,
    pub inputs: Vec<InputDecl>,
    pub outputs: Vec<OutputDecl>,
    pub directives: TaskConfig,
    pub executor: String,
    /// Parallel bindings in flight; 1 forces blocking dispatch.
    pub max_forks: usize,
    pub when: Option<WhenGuard>,
    /// Names referenced by the body that are not declared parameters,
    /// in the order the compiler discovered them.
    pub free_var_names: Vec<String>,
    /// The enclosing script binding those names resolve against.
    pub binding: TaskContext,
}

impl ProcessConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            directives: TaskConfig::default(),
            executor: "local".to_string(),
            max_forks: default_max_forks(),
            when: None,
            free_var_names: Vec::new(),
            binding: TaskContext::new(),
        }
    }

    pub fn input(mut self, decl: InputDecl) -> Self {
        self.inputs.push(decl);
        self
    }

    pub fn output(mut self, decl: OutputDecl) -> Self {
        self.outputs.push(decl);
        self
    }

    pub fn directives(mut self, directives: TaskConfig) -> Self {
        self.directives = directives;
        self
    }

    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.executor = name.into();
        self
    }

    pub fn max_forks(mut self, forks: usize) -> Self {
        self.max_forks = forks.max(1);
        self
    }

    pub fn when(mut self, guard: WhenGuard) -> Self {
        self.when = Some(guard);
        self
    }

    pub fn free_var(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        self.free_var_names.push(name.clone());
        self.binding.set(name, value);
        self
    }

    pub fn has_each_input(&self) -> bool {
        self.inputs.iter().any(InputDecl::is_each)
    }

    /// A processor stops after its first binding iff every input is scalar
    /// and none is iterable-expanding.
    pub fn is_single_shot(&self) -> bool {
        !self.has_each_input() && self.inputs.iter().all(|i| i.scalar)
    }
}

/// Default operator parallelism: the host pool size.
pub fn default_max_forks() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
