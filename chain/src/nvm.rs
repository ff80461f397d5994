//! Non-volatile placement.
//!
//! Everything the runtime must find again after a power failure lives in one
//! image: the context ring, the per-task recovery table and every channel
//! field. This module provides the marker trait for types allowed in that
//! image, the cell type all persistent stores go through, and the
//! shared-memory region that stands in for FRAM on a host.
//!
//! - [`NonVolatile`] - types whose bytes mean the same thing after a reboot
//! - [`NvCell`] - a persistent, single-writer, volatile-access cell
//! - [`Fram`] - a POSIX shared memory object holding the image

pub mod cell;
pub mod region;

pub use cell::NvCell;
pub use region::{BootKind, Fram, FramError, FramMode, FramPath, NameProblem, Retained, Scratch};

/// Types that may be placed in the non-volatile image.
///
/// # Using the Derive Macro
///
/// ```
/// use chain::NonVolatile;
/// use chain::channel::{Field, SelfField};
///
/// #[derive(NonVolatile, Default)]
/// #[repr(C)]
/// struct Counters {
///     count: SelfField<u32>,
///     total: Field<u64>,
/// }
/// ```
///
/// # Safety
///
/// Implementers must guarantee:
///
/// | Property | Requirement | Rationale |
/// |----------|-------------|-----------|
/// | **Layout** | `#[repr(C)]` or `#[repr(transparent)]` | The image is reinterpreted by the next boot |
/// | **Addresses** | No pointers, references, heap types or `fn` pointers | A reboot reloads code and remaps the image |
/// | **Fields** | All fields are `NonVolatile` | The requirements apply recursively |
/// | **Drop** | Safe if `Drop` never runs | Power failures bypass destructors |
/// | **Initialization** | `Default` for image roots | Cold boot formats the image with it |
pub unsafe trait NonVolatile: Send {}

macro_rules! impl_non_volatile {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl NonVolatile for $t {}
        )*
    };
}

impl_non_volatile! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
}

unsafe impl<T: NonVolatile, const N: usize> NonVolatile for [T; N] {}
