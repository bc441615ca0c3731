// ABOUTME: Session state, run history and run-name generation
// ABOUTME: Exposes the process-wide run singleton and the history file API

pub mod error;
pub mod history;
pub mod namegen;
#[allow(clippy::module_inception)]
pub mod session;

pub use error::{Result, SessionError};
pub use history::{is_uuid_shaped, HistoryEntry, HistoryFile, HISTORY_FILE_NAME};
pub use session::{
    ControlSignal, ProcessorHandle, RunFault, Session, SessionBuilder, ABORT_GRACE,
};
