//! The two-record context ring.
//!
//! A context names the in-flight task and the logical time its activation
//! began. Exactly two records exist. One is active; the other is free and is
//! the only record a transition writes before switching the active index, so
//! a power failure leaves either the old or the new activation in force,
//! never a mix.

use core::fmt;

use crate::NonVolatile;
use crate::nvm::NvCell;
use crate::task::TaskId;
use crate::time::LogicalTime;

/// A (task, time) pair read out of the ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Activation {
    /// Task in progress.
    pub task: TaskId,
    /// Logical time at which the activation began.
    pub time: LogicalTime,
}

impl Activation {
    /// Whether this is the record of a fresh image, before any transition.
    #[inline]
    pub fn is_bootstrap(&self) -> bool {
        self.time.is_zero()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task, self.time)
    }
}

/// One context record.
#[derive(NonVolatile, Debug, Default)]
#[repr(C)]
pub struct ContextRecord {
    task: NvCell<TaskId>,
    time: NvCell<LogicalTime>,
}

impl ContextRecord {
    /// The record's contents.
    pub fn load(&self) -> Activation {
        Activation {
            task: self.task.get(),
            time: self.time.get(),
        }
    }

    pub(crate) fn task_cell(&self) -> &NvCell<TaskId> {
        &self.task
    }

    pub(crate) fn time_cell(&self) -> &NvCell<LogicalTime> {
        &self.time
    }
}

/// Two context records and the index of the active one.
#[derive(NonVolatile, Debug, Default)]
#[repr(C)]
pub struct ContextRing {
    records: [ContextRecord; 2],
    active: NvCell<u8>,
}

impl ContextRing {
    /// Index of the active record.
    #[inline]
    pub fn active_index(&self) -> usize {
        usize::from(self.active.get() & 1)
    }

    /// Index of the free record.
    #[inline]
    pub fn free_index(&self) -> usize {
        1 - self.active_index()
    }

    /// The active activation.
    pub fn active(&self) -> Activation {
        self.records[self.active_index()].load()
    }

    /// The record a transition writes before committing.
    pub(crate) fn free(&self) -> &ContextRecord {
        &self.records[self.free_index()]
    }

    pub(crate) fn active_cell(&self) -> &NvCell<u8> {
        &self.active
    }

    /// Both records, by index.
    pub fn records(&self) -> &[ContextRecord; 2] {
        &self.records
    }
}
