//! Boot resumer.
//!
//! A [`Device`] pairs a [`Program`] with the persistent image it runs on.
//! Each [`power_on`](Device::power_on) is one boot: it runs the boot hook,
//! counts the boot, rebuilds the self-field registry and resumes the active
//! context. The boot lasts until the power supply fails.

use core::fmt;

use crate::NonVolatile;
use crate::context::Activation;
use crate::engine::{Chain, ChainState, SelfFieldRegistry, until_power_fails};
use crate::error::ChainError;
use crate::power::{PowerFailure, PowerSupply};
use crate::task::Program;
use crate::trace::{debug, info};

/// An application's persistent image.
///
/// The image holds the runtime's [`ChainState`] next to every channel of the
/// program. It is formatted with `Default` on first boot.
///
/// # Example
///
/// ```
/// use chain::channel::{Channel, SelfField};
/// use chain::engine::{ChainState, SelfFieldRegistry};
/// use chain::{ChainError, NonVolatile, Persistent, TaskId};
///
/// const COUNTER: TaskId = TaskId::new(0);
///
/// #[derive(NonVolatile, Default)]
/// #[repr(C)]
/// struct Own {
///     count: SelfField<u32>,
/// }
///
/// #[derive(NonVolatile)]
/// #[repr(C)]
/// struct Nv {
///     chain: ChainState,
///     own: Channel<Own>,
/// }
///
/// impl Default for Nv {
///     fn default() -> Self {
///         Self {
///             chain: ChainState::default(),
///             own: Channel::self_channel("counter", Own::default()),
///         }
///     }
/// }
///
/// impl Persistent for Nv {
///     fn chain(&self) -> &ChainState {
///         &self.chain
///     }
///
///     fn register<'a>(&'a self, registry: &mut SelfFieldRegistry<'a>) -> Result<(), ChainError> {
///         registry.register(COUNTER, &self.own.count)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Persistent: NonVolatile {
    /// The runtime state inside the image.
    fn chain(&self) -> &ChainState;

    /// Registers every self field with its owning task, in a fixed order.
    ///
    /// # Errors
    ///
    /// Propagates registry errors.
    fn register<'a>(&'a self, registry: &mut SelfFieldRegistry<'a>) -> Result<(), ChainError> {
        let _ = registry;
        Ok(())
    }
}

/// How a boot went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    /// Boot number, starting at 1 for the first boot of the image. `None`
    /// when power failed on the store that counts the boot.
    pub boot: Option<u64>,
    /// Activation in force when the boot started.
    pub resumed: Activation,
    /// Activation in force when power failed.
    pub reached: Activation,
    /// Power draws the boot made.
    pub draws: u64,
    /// The failure that ended the boot.
    pub failure: PowerFailure,
}

impl BootReport {
    /// Transitions committed during this boot.
    pub fn progress(&self) -> u64 {
        self.reached.time.get() - self.resumed.time.get()
    }
}

impl fmt::Display for BootReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.boot {
            Some(n) => write!(f, "boot {n}: ")?,
            None => f.write_str("uncounted boot: ")?,
        }
        write!(
            f,
            "{} -> {} in {} draws, {}",
            self.resumed, self.reached, self.draws, self.failure
        )
    }
}

/// A program bound to its persistent image.
pub struct Device<'img, S> {
    program: Program<S>,
    image: &'img S,
}

impl<'img, S: Persistent> Device<'img, S> {
    /// Binds `program` to `image`.
    pub fn new(program: Program<S>, image: &'img S) -> Self {
        Self { program, image }
    }

    /// The program.
    pub fn program(&self) -> &Program<S> {
        &self.program
    }

    /// The persistent image.
    pub fn image(&self) -> &'img S {
        self.image
    }

    /// The runtime state inside the image.
    pub fn state(&self) -> &'img ChainState {
        self.image.chain()
    }

    /// Boots once and runs until `supply` fails.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if self-field registration fails or names a
    /// task the program does not have. Nothing is stored in that case.
    ///
    /// # Panics
    ///
    /// Contract violations inside tasks or the runtime propagate as panics.
    pub fn power_on(&self, supply: &mut dyn PowerSupply) -> Result<BootReport, ChainError> {
        self.program.run_boot_hook();

        let state = self.image.chain();
        let mut registry = SelfFieldRegistry::new();
        self.image.register(&mut registry)?;
        if let Some(owner) = registry.owners().find(|&o| !self.program.contains(o)) {
            return Err(ChainError::UnknownOwner(owner));
        }

        let resumed = state.active();
        let before = state.boots();
        let chain = Chain::new(state, registry, supply);
        let failure = until_power_fails(|| {
            chain.count_boot();
            info!(boot = state.boots(), %resumed, "boot");
            chain.run(&self.program, self.image)
        });

        let report = BootReport {
            boot: (state.boots() != before).then(|| state.boots()),
            resumed,
            reached: state.active(),
            draws: chain.draws(),
            failure,
        };
        debug!(%report, "boot ended");
        Ok(report)
    }

    /// Boots `boots` times in a row with the same supply.
    ///
    /// # Errors
    ///
    /// Stops at the first boot that returns an error.
    pub fn power_cycle(
        &self,
        supply: &mut dyn PowerSupply,
        boots: usize,
    ) -> Result<Vec<BootReport>, ChainError> {
        (0..boots).map(|_| self.power_on(&mut *supply)).collect()
    }
}

impl<S> fmt::Debug for Device<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}
