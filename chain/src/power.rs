//! Power model.
//!
//! A host process never loses power, so the runtime asks a [`PowerSupply`]
//! before every persistent store it performs. When the supply answers
//! [`Power::Off`] the current boot is unwound with a [`PowerFailure`]
//! payload: nothing after the probe runs, exactly as if the device had lost
//! power between two instructions. Volatile state (the stack, the self-field
//! registry, every local) is discarded with the unwound frames; the
//! non-volatile image keeps whatever was stored before the probe.
//!
//! # Supplies
//!
//! | Supply | Fails |
//! |--------|-------|
//! | [`Mains`] | never |
//! | [`Brownout`] | on every n-th draw of a boot |
//! | [`Outage`] | once, at the first matching probe |
//! | [`Harvester`] | when a random per-boot energy budget runs out |

use core::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::task::TaskId;
use crate::time::LogicalTime;

/// The store a probe precedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Boundary {
    /// Incrementing the boot counter.
    BootCount,
    /// Writing the task of the free context record.
    ContextTask,
    /// Writing the time of the free context record.
    ContextTime,
    /// Switching the active context index.
    Commit,
    /// Applying a pending self-field swap on a first attempt.
    PrologueFlip,
    /// Dropping a pending self-field swap on a retry.
    PrologueDiscard,
    /// Clearing the dirty list.
    DirtyReset,
    /// Recording the attempt time.
    LastAttempt,
    /// Entering the task body. No store follows; the probe marks the point
    /// where recovery is complete.
    TaskEntry,
    /// Writing a channel value.
    FieldValue,
    /// Writing a channel timestamp.
    FieldStamp,
    /// Appending to the dirty list.
    DirtyEntry,
    /// Growing the dirty list.
    DirtyCount,
    /// Marking a self field's swap as pending.
    SwapPending,
    /// An explicit probe placed in a task body.
    Checkpoint,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where the runtime is when it draws power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// The store about to happen.
    pub boundary: Boundary,
    /// Active task.
    pub task: TaskId,
    /// Logical time of the active activation.
    pub time: LogicalTime,
    /// Draws made earlier in this boot.
    pub seq: u64,
    /// Label of an explicit checkpoint.
    pub label: Option<&'static str>,
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}@{} (draw {})", self.boundary, self.task, self.time, self.seq)?;
        if let Some(label) = self.label {
            write!(f, " at '{label}'")?;
        }
        Ok(())
    }
}

/// Answer of a supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    /// The store may happen.
    On,
    /// Power is lost before the store.
    Off,
}

/// Decides, probe by probe, whether power holds.
pub trait PowerSupply {
    /// Called before every runtime store.
    fn draw(&mut self, probe: &Probe) -> Power;
}

impl<P: PowerSupply + ?Sized> PowerSupply for &mut P {
    fn draw(&mut self, probe: &Probe) -> Power {
        (**self).draw(probe)
    }
}

/// Unwind payload of a lost boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerFailure {
    /// The probe that found no power.
    pub probe: Probe,
}

impl fmt::Display for PowerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "power failed before {}", self.probe)
    }
}

impl std::error::Error for PowerFailure {}

/// A supply that never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mains;

impl PowerSupply for Mains {
    fn draw(&mut self, _probe: &Probe) -> Power {
        Power::On
    }
}

/// Fails on every n-th draw of each boot.
#[derive(Debug, Clone, Copy)]
pub struct Brownout {
    period: u64,
}

impl Brownout {
    /// Fails on draws `n - 1`, `2n - 1`, ... of a boot; the first failure ends
    /// the boot, so in practice each boot gets `n - 1` successful draws.
    /// A period of 0 is treated as 1.
    #[must_use]
    pub fn every(n: u64) -> Self {
        Self { period: n.max(1) }
    }
}

impl PowerSupply for Brownout {
    fn draw(&mut self, probe: &Probe) -> Power {
        if (probe.seq + 1) % self.period == 0 {
            Power::Off
        } else {
            Power::On
        }
    }
}

/// Fails once, at the first probe the trigger accepts, then behaves like
/// [`Mains`].
pub struct Outage<F> {
    trigger: F,
    spent: bool,
}

impl<F: FnMut(&Probe) -> bool> Outage<F> {
    /// Fails at the first probe for which `trigger` returns `true`.
    pub fn when(trigger: F) -> Self {
        Self {
            trigger,
            spent: false,
        }
    }

    /// Whether the outage has happened.
    pub fn is_spent(&self) -> bool {
        self.spent
    }
}

impl Outage<fn(&Probe) -> bool> {
    /// Fails at the `k`-th draw counted across every boot, starting at 0.
    pub fn at(k: u64) -> Outage<impl FnMut(&Probe) -> bool> {
        let mut drawn = 0u64;
        Outage::when(move |_: &Probe| {
            let hit = drawn == k;
            drawn += 1;
            hit
        })
    }
}

impl<F: FnMut(&Probe) -> bool> PowerSupply for Outage<F> {
    fn draw(&mut self, probe: &Probe) -> Power {
        if !self.spent && (self.trigger)(probe) {
            self.spent = true;
            Power::Off
        } else {
            Power::On
        }
    }
}

impl<F> fmt::Debug for Outage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outage")
            .field("spent", &self.spent)
            .finish_non_exhaustive()
    }
}

/// An energy harvester: each boot starts with a random budget of draws.
#[derive(Debug)]
pub struct Harvester {
    rng: StdRng,
    min: u64,
    max: u64,
    budget: u64,
}

impl Harvester {
    /// Budgets are drawn uniformly from `min..=max`; the bounds are swapped
    /// if given in the wrong order.
    #[must_use]
    pub fn new(min: u64, max: u64) -> Self {
        Self::with_rng(StdRng::from_os_rng(), min, max)
    }

    /// Like [`new`](Self::new) with a reproducible sequence of budgets.
    #[must_use]
    pub fn seeded(seed: u64, min: u64, max: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), min, max)
    }

    fn with_rng(rng: StdRng, min: u64, max: u64) -> Self {
        Self {
            rng,
            min: min.min(max),
            max: max.max(min),
            budget: 0,
        }
    }

    /// Budget of the current boot.
    pub fn budget(&self) -> u64 {
        self.budget
    }
}

impl PowerSupply for Harvester {
    fn draw(&mut self, probe: &Probe) -> Power {
        if probe.seq == 0 {
            self.budget = self.rng.random_range(self.min..=self.max);
        }
        if probe.seq >= self.budget {
            Power::Off
        } else {
            Power::On
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(seq: u64) -> Probe {
        Probe {
            boundary: Boundary::FieldValue,
            task: TaskId::new(0),
            time: LogicalTime::new(1),
            seq,
            label: None,
        }
    }

    #[test]
    fn test_mains_never_fails() {
        let mut supply = Mains;
        assert!((0..1000).all(|seq| supply.draw(&probe(seq)) == Power::On));
    }

    #[test]
    fn test_brownout_period() {
        let mut supply = Brownout::every(3);
        let answers: Vec<_> = (0..6).map(|seq| supply.draw(&probe(seq))).collect();
        assert_eq!(
            answers,
            [Power::On, Power::On, Power::Off, Power::On, Power::On, Power::Off]
        );
    }

    #[test]
    fn test_brownout_zero_period_always_fails() {
        let mut supply = Brownout::every(0);
        assert_eq!(supply.draw(&probe(0)), Power::Off);
    }

    #[test]
    fn test_outage_is_one_shot() {
        let mut supply = Outage::when(|p: &Probe| p.seq >= 2);
        assert_eq!(supply.draw(&probe(0)), Power::On);
        assert_eq!(supply.draw(&probe(2)), Power::Off);
        assert!(supply.is_spent());
        assert_eq!(supply.draw(&probe(3)), Power::On);
    }

    #[test]
    fn test_outage_at_counts_across_boots() {
        let mut supply = Outage::at(3);
        // Two boots of two draws each: the global draw 3 is the second draw
        // of the second boot.
        assert_eq!(supply.draw(&probe(0)), Power::On);
        assert_eq!(supply.draw(&probe(1)), Power::On);
        assert_eq!(supply.draw(&probe(0)), Power::On);
        assert_eq!(supply.draw(&probe(1)), Power::Off);
        assert_eq!(supply.draw(&probe(2)), Power::On);
    }

    #[test]
    fn test_harvester_budget_bounds() {
        let mut supply = Harvester::seeded(7, 5, 10);
        for _ in 0..50 {
            let mut seq = 0;
            while supply.draw(&probe(seq)) == Power::On {
                seq += 1;
            }
            assert!((5..=10).contains(&seq));
            assert_eq!(seq, supply.budget());
        }
    }

    #[test]
    fn test_harvester_is_reproducible() {
        let mut a = Harvester::seeded(42, 1, 1000);
        let mut b = Harvester::seeded(42, 1000, 1);
        for _ in 0..10 {
            a.draw(&probe(0));
            b.draw(&probe(0));
            assert_eq!(a.budget(), b.budget());
        }
    }

    #[test]
    fn test_failure_display() {
        let failure = PowerFailure {
            probe: Probe {
                label: Some("mid-sum"),
                ..probe(4)
            },
        };
        assert_eq!(
            failure.to_string(),
            "power failed before FieldValue in #0@t1 (draw 4) at 'mid-sum'"
        );
    }
}
