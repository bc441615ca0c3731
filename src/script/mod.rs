// ABOUTME: Task script generation for work-dir execution
// ABOUTME: Exposes the launcher, work-dir file names and stage/unstage helpers

pub mod launcher;
pub mod stage;

pub use launcher::{
    TaskLauncher, TaskPaths, CMD_CONTEXT, CMD_ENV, CMD_ERR, CMD_EXIT, CMD_LOG, CMD_MANIFEST,
    CMD_OUT, CMD_RUN, CMD_SCRIPT,
};
pub use stage::{shell_escape, stage_script, unstage_script, StagedFile};
