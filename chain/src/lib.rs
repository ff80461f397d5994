//! Crash-consistent task runtime for intermittently-powered devices.
//!
//! A program is a set of tasks. Each task runs to completion and ends by
//! transitioning to another task; values move between tasks through
//! timestamped channel fields kept in non-volatile memory. Power may fail at
//! any store. On every boot the runtime resumes the activation that was in
//! force, re-running its task from the entry point, and guarantees that:
//!
//! - a transition is committed exactly once, by a single store;
//! - readers see the most recently written of several producer fields;
//! - a task's writes to its own self channel become visible to its next
//!   activation exactly once, and never when the writing attempt was lost.
//!
//! # Modules
//!
//! - [`time`] - the logical clock
//! - [`nvm`] - placement of the persistent image
//! - [`channel`] - timestamped fields and their declarations
//! - [`task`] - task registration
//! - [`context`] - the two-record context ring
//! - [`engine`] - transitions and the recovery prologue
//! - [`boot`] - the boot resumer
//! - [`power`] - the simulated power supply
//!
//! # Example
//!
//! ```
//! use chain::channel::{Channel, Field};
//! use chain::engine::ChainState;
//! use chain::power::Brownout;
//! use chain::{Device, NonVolatile, Persistent, Program, TaskCtx, TaskId, Transition};
//!
//! const PRODUCE: TaskId = TaskId::new(0);
//! const CONSUME: TaskId = TaskId::new(1);
//!
//! #[derive(NonVolatile, Default)]
//! #[repr(C)]
//! struct Msg {
//!     value: Field<u64>,
//! }
//!
//! #[derive(NonVolatile)]
//! #[repr(C)]
//! struct Nv {
//!     chain: ChainState,
//!     msg: Channel<Msg>,
//! }
//!
//! impl Persistent for Nv {
//!     fn chain(&self) -> &ChainState {
//!         &self.chain
//!     }
//! }
//!
//! fn produce(cx: TaskCtx<'_, Nv>) -> Transition {
//!     let value = cx.time().get() * 10;
//!     cx.out(value, &[&cx.nv().msg.value]);
//!     cx.transition_to(CONSUME)
//! }
//!
//! fn consume(cx: TaskCtx<'_, Nv>) -> Transition {
//!     let value = cx.sync::<u64>(&[&cx.nv().msg.value]);
//!     assert_eq!(value % 10, 0);
//!     cx.transition_to(PRODUCE)
//! }
//!
//! let image = Nv {
//!     chain: ChainState::default(),
//!     msg: Channel::task("produce", "consume", Msg::default()),
//! };
//! let program = Program::builder()
//!     .task(PRODUCE, "produce", produce)
//!     .task(CONSUME, "consume", consume)
//!     .entry(PRODUCE)
//!     .build()?;
//!
//! let device = Device::new(program, &image);
//! for _ in 0..5 {
//!     device.power_on(&mut Brownout::every(25))?;
//! }
//! assert!(device.state().committed_transitions() > 1);
//! # Ok::<(), chain::ChainError>(())
//! ```

// Allow the crate to reference itself as ::chain for derive macro usage
extern crate self as chain;

pub mod boot;
pub mod channel;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod nvm;
pub mod power;
pub mod task;
pub mod time;
pub mod trace;

#[doc(inline)]
pub use chain_derive::NonVolatile;

#[doc(inline)]
pub use nvm::NonVolatile;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use nvm::NonVolatile as __NonVolatilePrivate;

pub use boot::{BootReport, Device, Persistent};
pub use engine::{TaskCtx, Transition};
pub use error::ChainError;
pub use task::{Program, TaskId};
pub use time::LogicalTime;
pub use trace::init_tracing;
