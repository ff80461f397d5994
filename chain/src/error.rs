//! Errors of the fallible setup paths.
//!
//! The hot path (sync, out, transition, prologue) has no error channel:
//! contract violations there are assertions, and interrupted stores are
//! healed by the next boot.

use thiserror::Error;

use crate::nvm::FramError;
use crate::task::{MAX_TASKS, TaskId};

/// Program construction and self-field registration errors.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Two tasks share an index.
    #[error("task index {0} registered twice")]
    DuplicateTask(TaskId),

    /// The index does not fit in a task mask.
    #[error("task index {0} out of range (max {max})", max = MAX_TASKS - 1)]
    TaskOutOfRange(TaskId),

    /// The builder has no tasks.
    #[error("program has no tasks")]
    EmptyProgram,

    /// `entry` was never called.
    #[error("program has no entry task")]
    MissingEntry,

    /// The entry task is not one of the registered tasks.
    #[error("entry task {0} is not registered")]
    UnknownEntry(TaskId),

    /// A self field names an owner that is not a registered task.
    #[error("self field owner {0} is not registered")]
    UnknownOwner(TaskId),

    /// The registry is full.
    #[error("more than {0} self fields registered")]
    TooManySelfFields(usize),

    /// The same self field was registered twice.
    #[error("self field registered twice (owner {0})")]
    DuplicateSelfField(TaskId),

    /// The non-volatile image could not be mapped.
    #[error("non-volatile image: {0}")]
    Fram(#[from] FramError),
}
