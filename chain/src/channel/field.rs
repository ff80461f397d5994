//! Timestamped field shapes: point-to-point, self and multicast.

use core::fmt;

use crate::NonVolatile;
use crate::engine::Writer;
use crate::nvm::NvCell;
use crate::power::Boundary;
use crate::time::LogicalTime;

use super::{Sink, Source, Stamped, sealed};

/// A timestamped value written by one producer task.
///
/// A timestamp of [`LogicalTime::ZERO`] means the field was never written.
#[derive(NonVolatile)]
#[repr(C)]
pub struct Field<T: Copy> {
    stamp: NvCell<LogicalTime>,
    value: NvCell<T>,
}

impl<T: Copy> Field<T> {
    /// Creates a never-written field holding `initial`.
    pub const fn new(initial: T) -> Self {
        Self {
            stamp: NvCell::new(LogicalTime::ZERO),
            value: NvCell::new(initial),
        }
    }

    /// Logical time of the last write.
    #[inline]
    pub fn timestamp(&self) -> LogicalTime {
        self.stamp.get()
    }

    /// Last written value.
    #[inline]
    pub fn value(&self) -> T {
        self.value.get()
    }

    /// Timestamp and value together.
    #[inline]
    pub fn stamped(&self) -> Stamped<T> {
        Stamped {
            time: self.timestamp(),
            value: self.value(),
        }
    }

    #[cfg(test)]
    pub(crate) fn store(&self, value: T, time: LogicalTime) {
        self.value.set(value);
        self.stamp.set(time);
    }

    // Value first: a failure between the two stores leaves the old timestamp,
    // and the interrupted task rewrites both on re-execution.
    fn put_probed(&self, value: T, w: &Writer<'_>) {
        w.store(Boundary::FieldValue, &self.value, value);
        w.store(Boundary::FieldStamp, &self.stamp, w.time());
    }
}

impl<T: Copy + Default> Default for Field<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("stamp", &self.timestamp())
            .field("value", &self.value())
            .finish()
    }
}

impl<T: Copy> sealed::Sealed for Field<T> {}

impl<T: Copy> Source<T> for Field<T> {
    fn current(&self) -> Stamped<T> {
        self.stamped()
    }
}

impl<T: Copy> Sink<T> for Field<T> {
    fn put(&self, value: T, w: &Writer<'_>) {
        self.put_probed(value, w);
    }
}

/// Buffer roles of a self field.
///
/// Both flags live in one cell so that a flip and the clearing of the pending
/// flag persist as a single store.
#[derive(NonVolatile, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SwapState {
    /// `false`: slot 0 is current and slot 1 is next. `true`: the reverse.
    pub role: bool,
    /// A completed write to the next slot is waiting to become current.
    pub pending: bool,
}

impl SwapState {
    /// Index of the slot readers see.
    #[inline]
    #[must_use]
    pub const fn current(self) -> usize {
        self.role as usize
    }

    /// Index of the slot the owning task writes.
    #[inline]
    #[must_use]
    pub const fn next(self) -> usize {
        1 - self.current()
    }

    /// Applies a pending swap. A state without a pending swap is unchanged, so
    /// applying twice is the same as applying once.
    #[inline]
    #[must_use]
    pub const fn committed(self) -> Self {
        if self.pending {
            Self {
                role: !self.role,
                pending: false,
            }
        } else {
            self
        }
    }

    /// Drops a pending swap without touching the roles.
    #[inline]
    #[must_use]
    pub const fn discarded(self) -> Self {
        Self {
            role: self.role,
            pending: false,
        }
    }
}

/// A variable a task passes to its own future activations.
///
/// Two physical slots separate the value being read (current) from the value
/// being written (next). A write only becomes current when the owning task's
/// next activation commits it in its recovery prologue, so a write made by an
/// attempt that never reached its transition is never observed.
#[derive(NonVolatile)]
#[repr(C)]
pub struct SelfField<T: Copy> {
    slots: [Field<T>; 2],
    swap: NvCell<SwapState>,
}

impl<T: Copy> SelfField<T> {
    /// Creates a never-written self field with both slots holding `initial`.
    pub const fn new(initial: T) -> Self {
        Self {
            slots: [Field::new(initial), Field::new(initial)],
            swap: NvCell::new(SwapState {
                role: false,
                pending: false,
            }),
        }
    }

    /// The committed value and its timestamp.
    pub fn stamped(&self) -> Stamped<T> {
        self.slots[self.swap.get().current()].stamped()
    }

    /// Contents of the next slot, committed or not.
    pub fn staged(&self) -> Stamped<T> {
        self.slots[self.swap.get().next()].stamped()
    }

    /// Current buffer roles.
    pub fn swap_state(&self) -> SwapState {
        self.swap.get()
    }

    pub(crate) fn swap_cell(&self) -> &NvCell<SwapState> {
        &self.swap
    }

    #[cfg(test)]
    pub(crate) fn slots_for_test(&self) -> &[Field<T>; 2] {
        &self.slots
    }
}

impl<T: Copy + Default> Default for SelfField<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for SelfField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfField")
            .field("slots", &self.slots)
            .field("swap", &self.swap_state())
            .finish()
    }
}

impl<T: Copy> sealed::Sealed for SelfField<T> {}

impl<T: Copy> Source<T> for SelfField<T> {
    fn current(&self) -> Stamped<T> {
        self.stamped()
    }
}

impl<T: Copy> Sink<T> for SelfField<T> {
    fn put(&self, value: T, w: &Writer<'_>) {
        let next = self.swap.get().next();
        self.slots[next].put_probed(value, w);
        w.mark_dirty(&self.swap);
    }
}

/// One producer, `N` typed-identical legs, one per consumer.
///
/// A single `out` call writes the same value and timestamp to every leg.
#[derive(NonVolatile)]
#[repr(C)]
pub struct Multicast<T: Copy, const N: usize> {
    legs: [Field<T>; N],
}

impl<T: Copy, const N: usize> Multicast<T, N> {
    /// Creates a never-written multicast with every leg holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            legs: core::array::from_fn(|_| Field::new(initial)),
        }
    }

    /// The leg read by consumer `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= N`.
    pub fn leg(&self, idx: usize) -> &Field<T> {
        &self.legs[idx]
    }

    /// Iterates over all legs.
    pub fn legs(&self) -> impl Iterator<Item = &Field<T>> {
        self.legs.iter()
    }
}

impl<T: Copy + Default, const N: usize> Default for Multicast<T, N> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug, const N: usize> fmt::Debug for Multicast<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.legs.iter()).finish()
    }
}

impl<T: Copy, const N: usize> sealed::Sealed for Multicast<T, N> {}

impl<T: Copy, const N: usize> Sink<T> for Multicast<T, N> {
    fn put(&self, value: T, w: &Writer<'_>) {
        for leg in &self.legs {
            leg.put_probed(value, w);
        }
    }
}
