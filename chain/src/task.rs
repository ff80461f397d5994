//! Task table: identities, entry points and per-task recovery state.

use core::fmt;

use crate::NonVolatile;
use crate::engine::{SelfFieldId, TaskCtx, Transition};
use crate::error::ChainError;
use crate::nvm::NvCell;
use crate::time::LogicalTime;

/// Highest number of tasks in a program; every task needs a distinct mask bit.
pub const MAX_TASKS: usize = 32;

/// Capacity of a task's dirty list: distinct self fields one activation may
/// write.
pub const MAX_DIRTY_FIELDS: usize = 8;

/// Numeric task index.
#[derive(NonVolatile, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u8);

impl TaskId {
    /// Creates a task id. Programs only accept indices below [`MAX_TASKS`].
    #[inline]
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// The numeric index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The single-bit mask of this task, if the index is in range.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> Option<TaskMask> {
        match 1u32.checked_shl(self.0 as u32) {
            Some(bits) => Some(TaskMask(bits)),
            None => None,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Set of tasks, one bit per task index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskMask(u32);

impl TaskMask {
    /// No tasks.
    pub const EMPTY: Self = Self(0);

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every task of `other` is in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both sets.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Number of tasks in the set.
    #[inline]
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Persistent recovery state of one task.
///
/// Only the task's own activations and prologues modify it.
#[derive(NonVolatile, Debug, Default)]
#[repr(C)]
pub struct TaskState {
    dirty: [NvCell<SelfFieldId>; MAX_DIRTY_FIELDS],
    count: NvCell<u8>,
    last_attempt: NvCell<LogicalTime>,
}

impl TaskState {
    /// Logical time at which this task last began executing.
    pub fn last_attempt(&self) -> LogicalTime {
        self.last_attempt.get()
    }

    /// Number of valid dirty-list entries.
    pub fn dirty_len(&self) -> usize {
        usize::from(self.count.get()).min(MAX_DIRTY_FIELDS)
    }

    /// Valid dirty-list entries, oldest first.
    pub fn dirty(&self) -> impl Iterator<Item = SelfFieldId> + '_ {
        self.dirty[..self.dirty_len()].iter().map(NvCell::get)
    }

    pub(crate) fn entry(&self, slot: usize) -> &NvCell<SelfFieldId> {
        &self.dirty[slot]
    }

    pub(crate) fn count_cell(&self) -> &NvCell<u8> {
        &self.count
    }

    pub(crate) fn last_attempt_cell(&self) -> &NvCell<LogicalTime> {
        &self.last_attempt
    }
}

type Entry<S> = Box<dyn Fn(TaskCtx<'_, S>) -> Transition>;

/// A registered task.
pub struct TaskDef<S> {
    id: TaskId,
    mask: TaskMask,
    name: &'static str,
    entry: Entry<S>,
}

impl<S> TaskDef<S> {
    /// Task index.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Single-bit mask.
    pub fn mask(&self) -> TaskMask {
        self.mask
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn enter(&self, cx: TaskCtx<'_, S>) -> Transition {
        (self.entry)(cx)
    }
}

impl<S> fmt::Debug for TaskDef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef")
            .field("id", &self.id)
            .field("mask", &self.mask)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A validated set of tasks over the persistent image `S`.
pub struct Program<S> {
    tasks: [Option<TaskDef<S>>; MAX_TASKS],
    mask: TaskMask,
    entry: TaskId,
    on_boot: Option<Box<dyn Fn()>>,
}

impl<S> Program<S> {
    /// Starts a new program.
    pub fn builder() -> ProgramBuilder<S> {
        ProgramBuilder {
            tasks: Vec::new(),
            entry: None,
            on_boot: None,
        }
    }

    /// The task first entered on a fresh image.
    pub fn entry(&self) -> TaskId {
        self.entry
    }

    /// Task registered under `id`.
    pub fn task(&self, id: TaskId) -> Option<&TaskDef<S>> {
        self.tasks.get(id.index()).and_then(Option::as_ref)
    }

    /// Name of `id`, or `"?"` if it is not registered.
    pub fn name(&self, id: TaskId) -> &'static str {
        self.task(id).map_or("?", TaskDef::name)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: TaskId) -> bool {
        id.mask().is_some_and(|m| self.mask.contains(m))
    }

    /// Mask of all registered tasks.
    pub fn mask(&self) -> TaskMask {
        self.mask
    }

    /// Registered tasks in index order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDef<S>> {
        self.tasks.iter().flatten()
    }

    pub(crate) fn run_boot_hook(&self) {
        if let Some(hook) = &self.on_boot {
            hook();
        }
    }
}

impl<S> fmt::Debug for Program<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("tasks", &self.tasks().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

/// Collects tasks, the entry designation and the boot hook.
///
/// Validation is deferred to [`build`](Self::build).
pub struct ProgramBuilder<S> {
    tasks: Vec<(TaskId, &'static str, Entry<S>)>,
    entry: Option<TaskId>,
    on_boot: Option<Box<dyn Fn()>>,
}

impl<S> ProgramBuilder<S> {
    /// Registers a task.
    #[must_use]
    pub fn task<F>(mut self, id: TaskId, name: &'static str, entry: F) -> Self
    where
        F: Fn(TaskCtx<'_, S>) -> Transition + 'static,
    {
        self.tasks.push((id, name, Box::new(entry)));
        self
    }

    /// Designates the task entered on a fresh image.
    #[must_use]
    pub fn entry(mut self, id: TaskId) -> Self {
        self.entry = Some(id);
        self
    }

    /// Installs a hook run once at the start of every boot, before any task.
    #[must_use]
    pub fn on_boot<F: Fn() + 'static>(mut self, hook: F) -> Self {
        self.on_boot = Some(Box::new(hook));
        self
    }

    /// Validates the registrations.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] for an empty program, an index outside the mask
    /// range, a duplicate index, or a missing or unregistered entry task.
    pub fn build(self) -> Result<Program<S>, ChainError> {
        if self.tasks.is_empty() {
            return Err(ChainError::EmptyProgram);
        }

        let mut tasks: [Option<TaskDef<S>>; MAX_TASKS] = core::array::from_fn(|_| None);
        let mut mask = TaskMask::EMPTY;
        for (id, name, entry) in self.tasks {
            let bit = match id.mask() {
                Some(bit) if id.index() < MAX_TASKS => bit,
                _ => return Err(ChainError::TaskOutOfRange(id)),
            };
            if mask.contains(bit) {
                return Err(ChainError::DuplicateTask(id));
            }
            mask = mask.union(bit);
            tasks[id.index()] = Some(TaskDef {
                id,
                mask: bit,
                name,
                entry,
            });
        }

        let entry = self.entry.ok_or(ChainError::MissingEntry)?;
        if !entry.mask().is_some_and(|m| mask.contains(m)) {
            return Err(ChainError::UnknownEntry(entry));
        }

        Ok(Program {
            tasks,
            mask,
            entry,
            on_boot: self.on_boot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    fn idle(cx: TaskCtx<'_, Nothing>) -> Transition {
        let me = cx.task();
        cx.transition_to(me)
    }

    #[test]
    fn test_mask_is_single_bit() {
        assert_eq!(TaskId::new(0).mask().map(TaskMask::bits), Some(1));
        assert_eq!(TaskId::new(5).mask().map(TaskMask::bits), Some(32));
        assert_eq!(TaskId::new(31).mask().map(TaskMask::len), Some(1));
        assert!(TaskId::new(32).mask().is_none());
    }

    #[test]
    fn test_mask_set_ops() {
        let a = TaskId::new(1).mask().unwrap();
        let b = TaskId::new(3).mask().unwrap();
        let both = a.union(b);
        assert!(both.contains(a));
        assert!(both.contains(b));
        assert!(!a.contains(b));
        assert_eq!(both.len(), 2);
        assert!(TaskMask::EMPTY.is_empty());
    }

    #[test]
    fn test_build_program() {
        let program = Program::<Nothing>::builder()
            .task(TaskId::new(0), "a", idle)
            .task(TaskId::new(4), "b", idle)
            .entry(TaskId::new(0))
            .build()
            .unwrap();

        assert_eq!(program.entry(), TaskId::new(0));
        assert_eq!(program.name(TaskId::new(4)), "b");
        assert_eq!(program.name(TaskId::new(2)), "?");
        assert!(program.contains(TaskId::new(4)));
        assert!(!program.contains(TaskId::new(1)));
        assert!(!program.contains(TaskId::new(200)));
        assert_eq!(program.mask().bits(), 0b1_0001);
        let ids: Vec<_> = program.tasks().map(TaskDef::id).collect();
        assert_eq!(ids, [TaskId::new(0), TaskId::new(4)]);
    }

    #[test]
    fn test_build_rejects_empty() {
        let err = Program::<Nothing>::builder().build().unwrap_err();
        assert!(matches!(err, ChainError::EmptyProgram));
    }

    #[test]
    fn test_build_rejects_duplicate() {
        let err = Program::<Nothing>::builder()
            .task(TaskId::new(2), "a", idle)
            .task(TaskId::new(2), "b", idle)
            .entry(TaskId::new(2))
            .build()
            .unwrap_err();
        assert!(matches!(err, ChainError::DuplicateTask(id) if id == TaskId::new(2)));
    }

    #[test]
    fn test_build_rejects_out_of_range() {
        let err = Program::<Nothing>::builder()
            .task(TaskId::new(32), "a", idle)
            .entry(TaskId::new(32))
            .build()
            .unwrap_err();
        assert!(matches!(err, ChainError::TaskOutOfRange(_)));
        assert!(err.to_string().contains("max 31"));
    }

    #[test]
    fn test_build_requires_entry() {
        let err = Program::<Nothing>::builder()
            .task(TaskId::new(0), "a", idle)
            .build()
            .unwrap_err();
        assert!(matches!(err, ChainError::MissingEntry));

        let err = Program::<Nothing>::builder()
            .task(TaskId::new(0), "a", idle)
            .entry(TaskId::new(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ChainError::UnknownEntry(_)));
    }

    #[test]
    fn test_task_state_starts_clean() {
        let state = TaskState::default();
        assert_eq!(state.dirty_len(), 0);
        assert_eq!(state.dirty().count(), 0);
        assert!(state.last_attempt().is_zero());
    }

    #[test]
    fn test_dirty_len_is_clamped() {
        let state = TaskState::default();
        state.count_cell().set(200);
        assert_eq!(state.dirty_len(), MAX_DIRTY_FIELDS);
    }
}
