//! Transition engine and recovery prologue.
//!
//! # Transition Protocol
//!
//! ```text
//!   active ──► record[a]  (task, time)        record[1-a]  free
//!
//!   transition_to(next):
//!     1. record[1-a].task = next
//!     2. record[1-a].time = time + 1
//!     3. active = 1 - a                        ◄── commit point
//!     4. prologue(next, time + 1)
//!     5. enter next
//! ```
//!
//! A power failure before step 3 leaves the old activation active and the
//! old task re-executes from its entry point at the same time; writing the
//! free record again yields the same values. A failure after step 3 enters
//! the new activation.
//!
//! # Recovery Prologue
//!
//! Runs before every entry into an activation `(task, time)`:
//!
//! | Attempt | Condition | Dirty self fields | Then |
//! |---------|-----------|-------------------|------|
//! | first | `time != last_attempt` | pending swap applied | count = 0, last_attempt = time |
//! | retry | `time == last_attempt` | pending swap dropped | count = 0 |
//!
//! Swaps pending at the start of a first attempt were set by the task's
//! previous activation, which committed its transition; swaps pending at the
//! start of a retry were set by an abandoned attempt of this activation. Each
//! step is idempotent, so a failure inside the prologue heals by running it
//! again.

use core::cell::{Cell, RefCell};
use core::convert::Infallible;
use core::fmt;
use std::panic;

use crate::NonVolatile;
use crate::channel::{SelfField, Sink, Source, SwapState, freshest};
use crate::context::{Activation, ContextRing};
use crate::error::ChainError;
use crate::nvm::NvCell;
use crate::power::{Boundary, Power, PowerFailure, PowerSupply, Probe};
use crate::task::{MAX_DIRTY_FIELDS, MAX_TASKS, Program, TaskId, TaskState};
use crate::time::LogicalTime;
use crate::trace::{debug, trace, warn};

/// Highest number of self fields one image may register.
pub const MAX_SELF_FIELDS: usize = 256;

/// Runtime state persisted in the application's image.
///
/// Formatting the image with `Default` yields the bootstrap state: both
/// context records at time zero, empty dirty lists, no boots counted.
#[derive(NonVolatile, Debug, Default)]
#[repr(C)]
pub struct ChainState {
    ring: ContextRing,
    tasks: [TaskState; MAX_TASKS],
    boots: NvCell<u64>,
}

impl ChainState {
    /// The activation in force.
    pub fn active(&self) -> Activation {
        self.ring.active()
    }

    /// The context ring.
    pub fn ring(&self) -> &ContextRing {
        &self.ring
    }

    /// Recovery state of `task`.
    ///
    /// # Panics
    ///
    /// Panics if the index is not below [`MAX_TASKS`].
    pub fn task(&self, task: TaskId) -> &TaskState {
        &self.tasks[task.index()]
    }

    /// Boots observed, including the current one.
    pub fn boots(&self) -> u64 {
        self.boots.get()
    }

    /// Transitions committed so far, the bootstrap transition included.
    ///
    /// Every commit advances the clock by exactly one tick from zero, so the
    /// count is the active time.
    pub fn committed_transitions(&self) -> u64 {
        self.active().time.get()
    }
}

/// Index of a registered self field.
#[derive(NonVolatile, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SelfFieldId(u16);

impl SelfFieldId {
    /// Position in the registry.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for SelfFieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "self#{}", self.0)
    }
}

struct Registered<'a> {
    owner: TaskId,
    swap: &'a NvCell<SwapState>,
}

/// Volatile table from self-field ids to the fields of the image.
///
/// Dirty lists store ids, not addresses, so the table is rebuilt on every
/// boot. Registration order decides the ids and must be the same each time.
#[derive(Default)]
pub struct SelfFieldRegistry<'a> {
    fields: Vec<Registered<'a>>,
}

impl<'a> SelfFieldRegistry<'a> {
    /// An empty registry.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Registers `field` as owned by `owner`.
    ///
    /// # Errors
    ///
    /// [`ChainError::TooManySelfFields`] past [`MAX_SELF_FIELDS`], and
    /// [`ChainError::DuplicateSelfField`] if `field` is already registered.
    pub fn register<T: Copy>(
        &mut self,
        owner: TaskId,
        field: &'a SelfField<T>,
    ) -> Result<SelfFieldId, ChainError> {
        let swap = field.swap_cell();
        if self.fields.iter().any(|f| core::ptr::eq(f.swap, swap)) {
            return Err(ChainError::DuplicateSelfField(owner));
        }
        if self.fields.len() >= MAX_SELF_FIELDS {
            return Err(ChainError::TooManySelfFields(MAX_SELF_FIELDS));
        }
        let id = SelfFieldId(self.fields.len() as u16);
        self.fields.push(Registered { owner, swap });
        Ok(id)
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Owner of `id`.
    pub fn owner(&self, id: SelfFieldId) -> Option<TaskId> {
        self.fields.get(id.index()).map(|f| f.owner)
    }

    pub(crate) fn owners(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.fields.iter().map(|f| f.owner)
    }

    fn lookup(&self, swap: &NvCell<SwapState>) -> Option<(SelfFieldId, TaskId)> {
        self.fields
            .iter()
            .position(|f| core::ptr::eq(f.swap, swap))
            .map(|idx| (SelfFieldId(idx as u16), self.fields[idx].owner))
    }

    fn swap(&self, id: SelfFieldId) -> Option<&'a NvCell<SwapState>> {
        self.fields.get(id.index()).map(|f| f.swap)
    }
}

impl fmt::Debug for SelfFieldRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.fields.iter().map(|r| r.owner))
            .finish()
    }
}

/// Volatile state of one boot: the image's runtime state, the self-field
/// registry and the power supply.
pub struct Chain<'a> {
    state: &'a ChainState,
    registry: SelfFieldRegistry<'a>,
    supply: RefCell<&'a mut dyn PowerSupply>,
    draws: Cell<u64>,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        state: &'a ChainState,
        registry: SelfFieldRegistry<'a>,
        supply: &'a mut dyn PowerSupply,
    ) -> Self {
        Self {
            state,
            registry,
            supply: RefCell::new(supply),
            draws: Cell::new(0),
        }
    }

    /// Draws made so far in this boot.
    pub fn draws(&self) -> u64 {
        self.draws.get()
    }

    /// Persistent runtime state.
    pub fn state(&self) -> &'a ChainState {
        self.state
    }

    /// Asks the supply for power; unwinds the boot if there is none.
    fn draw(&self, boundary: Boundary, at: Activation, label: Option<&'static str>) {
        let seq = self.draws.get();
        self.draws.set(seq + 1);
        let probe = Probe {
            boundary,
            task: at.task,
            time: at.time,
            seq,
            label,
        };
        let power = self.supply.borrow_mut().draw(&probe);
        if power == Power::Off {
            warn!(%probe, "power failure");
            panic::resume_unwind(Box::new(PowerFailure { probe }));
        }
    }

    fn store<T: Copy>(&self, boundary: Boundary, at: Activation, cell: &NvCell<T>, value: T) {
        self.draw(boundary, at, None);
        cell.set(value);
    }

    pub(crate) fn count_boot(&self) {
        let boots = &self.state.boots;
        self.store(Boundary::BootCount, self.state.active(), boots, boots.get() + 1);
    }

    /// Steps 1-3 of the transition protocol.
    fn commit(&self, from: Activation, next: TaskId) -> Activation {
        let ring = &self.state.ring;
        let free = ring.free();
        let to = Activation {
            task: next,
            time: from.time.tick(),
        };

        self.store(Boundary::ContextTask, from, free.task_cell(), to.task);
        self.store(Boundary::ContextTime, from, free.time_cell(), to.time);
        self.store(
            Boundary::Commit,
            from,
            ring.active_cell(),
            ring.free_index() as u8,
        );

        debug!(%from, %to, "transition committed");
        to
    }

    /// Reconciles the dirty list of the activation about to be entered.
    pub(crate) fn prologue(&self, at: Activation) {
        let task = self.state.task(at.task);
        let first = task.last_attempt() != at.time;
        trace!(%at, first, dirty = task.dirty_len(), "prologue");

        for id in task.dirty() {
            let Some(swap) = self.registry.swap(id) else {
                warn!(%at, %id, "dirty entry names an unregistered self field");
                continue;
            };
            let state = swap.get();
            if !state.pending {
                continue;
            }
            if first {
                self.store(Boundary::PrologueFlip, at, swap, state.committed());
            } else {
                self.store(Boundary::PrologueDiscard, at, swap, state.discarded());
            }
        }

        if task.dirty_len() != 0 {
            self.store(Boundary::DirtyReset, at, task.count_cell(), 0);
        }
        if first {
            self.store(Boundary::LastAttempt, at, task.last_attempt_cell(), at.time);
        }
    }

    /// Resumes the active context and runs tasks until power fails.
    pub(crate) fn run<S>(&'a self, program: &'a Program<S>, image: &'a S) -> Infallible {
        let resumed = self.state.active();
        let mut at = if resumed.is_bootstrap() {
            debug!(entry = %program.entry(), "fresh image, entering program");
            self.commit(resumed, program.entry())
        } else {
            debug!(%resumed, task = program.name(resumed.task), "resuming");
            resumed
        };

        loop {
            let Some(def) = program.task(at.task) else {
                panic!("active context names unregistered task {}", at.task);
            };
            self.prologue(at);
            self.draw(Boundary::TaskEntry, at, None);
            trace!(%at, task = def.name(), "enter");

            let cx = TaskCtx {
                chain: self,
                program,
                image,
                at,
            };
            at = def.enter(cx).to;
        }
    }
}

impl fmt::Debug for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("active", &self.state.active())
            .field("registry", &self.registry)
            .field("draws", &self.draws.get())
            .finish_non_exhaustive()
    }
}

/// Proof that a task committed its transition.
///
/// Only [`TaskCtx::transition_to`] creates one, and it consumes the context,
/// so every entry point ends in exactly one transition.
#[must_use = "a task must return the transition it made"]
#[derive(Debug)]
pub struct Transition {
    to: Activation,
}

impl Transition {
    /// The activation that was committed.
    pub fn to(&self) -> Activation {
        self.to
    }
}

/// Write access handed to channel sinks.
pub struct Writer<'w> {
    chain: &'w Chain<'w>,
    at: Activation,
}

impl Writer<'_> {
    pub(crate) fn time(&self) -> LogicalTime {
        self.at.time
    }

    pub(crate) fn store<T: Copy>(&self, boundary: Boundary, cell: &NvCell<T>, value: T) {
        self.chain.store(boundary, self.at, cell, value);
    }

    /// Lists a self field on the active task's dirty list and marks its swap
    /// pending. Called after the next slot holds the new value.
    pub(crate) fn mark_dirty(&self, swap: &NvCell<SwapState>) {
        let task = self.at.task;
        let Some((id, owner)) = self.chain.registry.lookup(swap) else {
            panic!("task {task} wrote a self field that was never registered");
        };
        assert!(
            owner == task,
            "task {task} wrote {id}, which belongs to task {owner}"
        );

        let state = self.chain.state.task(task);
        let len = state.dirty_len();
        if !state.dirty().any(|listed| listed == id) {
            assert!(
                len < MAX_DIRTY_FIELDS,
                "dirty list of task {task} is full ({MAX_DIRTY_FIELDS} self fields)"
            );
            self.store(Boundary::DirtyEntry, state.entry(len), id);
            self.store(Boundary::DirtyCount, state.count_cell(), (len + 1) as u8);
        }

        let current = swap.get();
        if !current.pending {
            self.store(
                Boundary::SwapPending,
                swap,
                SwapState {
                    pending: true,
                    ..current
                },
            );
        }
    }
}

/// The running activation, handed to a task's entry point.
pub struct TaskCtx<'c, S> {
    chain: &'c Chain<'c>,
    program: &'c Program<S>,
    image: &'c S,
    at: Activation,
}

impl<'c, S> TaskCtx<'c, S> {
    /// The persistent image.
    pub fn nv(&self) -> &'c S {
        self.image
    }

    /// This task.
    pub fn task(&self) -> TaskId {
        self.at.task
    }

    /// Name of this task.
    pub fn name(&self) -> &'static str {
        self.program.name(self.at.task)
    }

    /// Logical time of this activation.
    pub fn time(&self) -> LogicalTime {
        self.at.time
    }

    /// Boots observed so far.
    pub fn boots(&self) -> u64 {
        self.chain.state.boots()
    }

    /// Reads the freshest value among `fields`.
    ///
    /// A self field contributes its committed slot, never the one this
    /// activation may have written.
    ///
    /// # Panics
    ///
    /// In debug builds, if `fields` is empty, if two written candidates share
    /// a timestamp, or if no candidate was ever written. Release builds
    /// return the first candidate's value in the last case.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn sync<T: Copy>(&self, fields: &[&dyn Source<T>]) -> T {
        let (idx, winner) = freshest(fields);
        debug_assert!(
            !winner.time.is_zero(),
            "no producer has written any of the {} fields read by task {}",
            fields.len(),
            self.at.task
        );
        trace!(
            at = %self.at,
            candidate = idx,
            stamp = %winner.time,
            source = fields[idx].diag().map(|d| d.source().as_str()),
            "sync"
        );
        winner.value
    }

    /// Like [`sync`](Self::sync), but returns `initial` when none of the
    /// fields was ever written.
    pub fn sync_or<T: Copy>(&self, initial: T, fields: &[&dyn Source<T>]) -> T {
        let (_, winner) = freshest(fields);
        if winner.time.is_zero() {
            trace!(at = %self.at, "sync: no producer yet, using initial value");
            initial
        } else {
            winner.value
        }
    }

    /// Writes `value`, stamped with this activation's time, to every sink.
    pub fn out<T: Copy>(&self, value: T, sinks: &[&dyn Sink<T>]) {
        let writer = self.writer();
        for sink in sinks {
            trace!(
                at = %self.at,
                dest = sink.diag().map(|d| d.dest().as_str()),
                "out"
            );
            sink.put(value, &writer);
        }
    }

    /// A power probe inside the task body, for fault injection.
    pub fn checkpoint(&self, label: &'static str) {
        self.chain.draw(Boundary::Checkpoint, self.at, Some(label));
    }

    /// Commits the transition to `next` and ends the task.
    ///
    /// # Panics
    ///
    /// Panics if `next` is not a task of the program.
    pub fn transition_to(self, next: TaskId) -> Transition {
        assert!(
            self.program.contains(next),
            "task {} transitioned to unregistered task {next}",
            self.at.task
        );
        Transition {
            to: self.chain.commit(self.at, next),
        }
    }

    fn writer(&self) -> Writer<'c> {
        Writer {
            chain: self.chain,
            at: self.at,
        }
    }
}

impl<S> fmt::Debug for TaskCtx<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCtx")
            .field("at", &self.at)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Runs `f`, turning a power failure inside it into an `Err`.
///
/// Any other panic keeps unwinding.
pub(crate) fn until_power_fails<F>(f: F) -> PowerFailure
where
    F: FnOnce() -> Infallible,
{
    match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
        Ok(never) => match never {},
        Err(payload) => match payload.downcast::<PowerFailure>() {
            Ok(failure) => *failure,
            Err(other) => panic::resume_unwind(other),
        },
    }
}
