//! Channel store: statically declared, timestamped fields passed between tasks.
//!
//! Every value a task hands to another task (or to its own future activation)
//! is a field in the non-volatile image, written together with the logical
//! time of the writing activation. Readers never consume values; they select
//! the freshest of the candidate fields that may hold the variable.
//!
//! # Field Shapes
//!
//! | Shape | Writers | Readers | Type |
//! |-------|---------|---------|------|
//! | point-to-point | one task | one task | [`Field`] |
//! | self | owning task | owning task, next activation | [`SelfField`] |
//! | multicast | one task | one task per leg | [`Multicast`] |
//!
//! Reads go through [`Source`], writes through [`Sink`]; both are sealed and
//! dispatched by [`TaskCtx::sync`](crate::TaskCtx::sync) and
//! [`TaskCtx::out`](crate::TaskCtx::out).
//!
//! # Example
//!
//! ```
//! use chain::NonVolatile;
//! use chain::channel::{Channel, Field};
//!
//! #[derive(NonVolatile, Default)]
//! #[repr(C)]
//! struct Sample {
//!     celsius: Field<i16>,
//! }
//!
//! let ch = Channel::task("sense", "report", Sample::default());
//! assert_eq!(ch.diag().source().as_str(), "sense");
//! assert!(ch.celsius.timestamp().is_zero());
//! ```

mod field;
mod meta;

pub use field::{Field, Multicast, SelfField, SwapState};
pub use meta::{ChanDiag, Channel, ChannelKind, Endpoint, NAME_CAP, Name};

use crate::engine::Writer;
use crate::time::LogicalTime;

/// A value together with the logical time it was written at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamped<T> {
    /// Write time; zero if never written.
    pub time: LogicalTime,
    /// The value.
    pub value: T,
}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A field that can be read by `sync`.
pub trait Source<T: Copy>: sealed::Sealed {
    /// The value readers may observe now, with its timestamp.
    ///
    /// For a self field this is the current slot, never the next one.
    fn current(&self) -> Stamped<T>;

    /// Channel metadata, when the field was reached through its channel.
    fn diag(&self) -> Option<&ChanDiag> {
        None
    }
}

/// A field that can be written by `out`.
pub trait Sink<T: Copy>: sealed::Sealed {
    /// Stores `value` stamped with the writer's logical time.
    fn put(&self, value: T, w: &Writer<'_>);

    /// Channel metadata, when the field was reached through its channel.
    fn diag(&self) -> Option<&ChanDiag> {
        None
    }
}

/// Picks the freshest candidate.
///
/// Returns the index of the winner and its stamped value. With every
/// candidate unwritten the first one wins; callers treat that as out of
/// contract.
///
/// # Panics
///
/// Debug builds panic on an empty candidate list and on two written
/// candidates sharing a timestamp.
pub(crate) fn freshest<T: Copy>(fields: &[&dyn Source<T>]) -> (usize, Stamped<T>) {
    debug_assert!(!fields.is_empty(), "sync needs at least one candidate field");

    let mut best = 0;
    let mut latest = fields[0].current();
    for (idx, field) in fields.iter().enumerate().skip(1) {
        let candidate = field.current();
        debug_assert!(
            candidate.time.is_zero() || candidate.time != latest.time,
            "two producers wrote the same variable at {}",
            candidate.time
        );
        if candidate.time > latest.time {
            best = idx;
            latest = candidate;
        }
    }
    (best, latest)
}
