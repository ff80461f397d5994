//! Persistent interior-mutable cell.

use core::cell::UnsafeCell;
use core::fmt;

use super::NonVolatile;

/// A single persistent value.
///
/// Reads and writes are volatile: the compiler may neither elide nor reorder
/// them with respect to each other, which is what makes the ordering
/// arguments of the transition protocol hold on real non-volatile memory.
///
/// `NvCell` never carries power probes itself. The runtime decides where a
/// power failure may strike by probing before each store it performs.
///
/// A cell may move to another thread but is never shared between threads:
/// an image belongs to one thread of control at a time.
///
/// ```compile_fail
/// use chain::nvm::NvCell;
///
/// fn shared<T: Sync>(_: &T) {}
/// shared(&NvCell::new(0u64));
/// ```
///
/// ```compile_fail
/// use chain::nvm::NvCell;
///
/// let cell = NvCell::new(0u64);
/// std::thread::scope(|s| {
///     s.spawn(|| cell.set(1));
///     cell.set(2);
/// });
/// ```
#[repr(transparent)]
pub struct NvCell<T: Copy>(UnsafeCell<T>);

impl<T: Copy> NvCell<T> {
    /// Creates a cell holding `value`.
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Reads the current value.
    #[inline]
    pub fn get(&self) -> T {
        // SAFETY: the pointer comes from a live UnsafeCell and T is Copy.
        // NvCell is !Sync, so every access happens on the owning thread, and
        // no reference to the interior is ever handed out.
        unsafe { core::ptr::read_volatile(self.0.get()) }
    }

    /// Overwrites the value.
    #[inline]
    pub fn set(&self, value: T) {
        // SAFETY: see `get`; the owning thread is the only writer.
        unsafe { core::ptr::write_volatile(self.0.get(), value) }
    }
}

impl<T: Copy + Default> Default for NvCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for NvCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NvCell").field(&self.get()).finish()
    }
}

// SAFETY: NvCell can be placed in the image because it is repr(transparent)
// around UnsafeCell<T> where T is NonVolatile.
unsafe impl<T: Copy + NonVolatile> NonVolatile for NvCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let cell = NvCell::new(7u32);
        assert_eq!(cell.get(), 7);
        cell.set(9);
        assert_eq!(cell.get(), 9);
    }

    #[test]
    fn test_default_and_debug() {
        let cell: NvCell<u16> = NvCell::default();
        assert_eq!(cell.get(), 0);
        assert_eq!(format!("{cell:?}"), "NvCell(0)");
    }

    #[test]
    fn test_moves_between_threads() {
        let cell = NvCell::new(1u64);
        let cell = std::thread::spawn(move || {
            cell.set(cell.get() + 1);
            cell
        })
        .join()
        .unwrap();
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_layout_is_transparent() {
        assert_eq!(size_of::<NvCell<u64>>(), size_of::<u64>());
        assert_eq!(align_of::<NvCell<u64>>(), align_of::<u64>());
    }
}
