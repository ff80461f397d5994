//! Shared fixture: a three-task relay over one image.
//!
//! ```text
//!   a: count += 1 (self), send tick = count to b
//!   b: total += tick (self), multicast total to c and a;
//!      even ticks go to c, odd ticks back to a
//!   c: acknowledge the total to a
//! ```
//!
//! `a` also reads the freshest total from two producers (`b` through the
//! multicast, `c` through the acknowledgement).

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use chain::channel::{Channel, Field, Multicast, SelfField, Stamped, SwapState};
use chain::context::Activation;
use chain::engine::{ChainState, SelfFieldRegistry};
use chain::power::{Boundary, Probe};
use chain::{ChainError, LogicalTime, NonVolatile, Persistent, Program, TaskCtx, TaskId};

pub const A: TaskId = TaskId::new(0);
pub const B: TaskId = TaskId::new(1);
pub const C: TaskId = TaskId::new(2);

pub const LEG_C: usize = 0;
pub const LEG_A: usize = 1;

#[derive(NonVolatile, Default)]
#[repr(C)]
pub struct Count {
    pub n: SelfField<u32>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
pub struct TickMsg {
    pub n: Field<u32>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
pub struct Sum {
    pub total: SelfField<u32>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
pub struct Report {
    pub total: Multicast<u32, 2>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
pub struct Ack {
    pub total: Field<u32>,
}

#[derive(NonVolatile)]
#[repr(C)]
pub struct Nv {
    pub chain: ChainState,
    pub count: Channel<Count>,
    pub tick: Channel<TickMsg>,
    pub sum: Channel<Sum>,
    pub report: Channel<Report>,
    pub ack: Channel<Ack>,
}

impl Default for Nv {
    fn default() -> Self {
        Self {
            chain: ChainState::default(),
            count: Channel::self_channel("a", Count::default()),
            tick: Channel::task("a", "b", TickMsg::default()),
            sum: Channel::self_channel("b", Sum::default()),
            report: Channel::multicast("report", "b", Report::default()),
            ack: Channel::task("c", "a", Ack::default()),
        }
    }
}

impl Persistent for Nv {
    fn chain(&self) -> &ChainState {
        &self.chain
    }

    fn register<'a>(&'a self, registry: &mut SelfFieldRegistry<'a>) -> Result<(), ChainError> {
        registry.register(A, &self.count.n)?;
        registry.register(B, &self.sum.total)?;
        Ok(())
    }
}

/// What a task read on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seen {
    pub task: TaskId,
    pub time: LogicalTime,
    pub value: u32,
}

/// Observations of every attempt, lost ones included.
pub type Log = Rc<RefCell<Vec<Seen>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn note(log: &Log, cx: &TaskCtx<'_, Nv>, value: u32) {
    log.borrow_mut().push(Seen {
        task: cx.task(),
        time: cx.time(),
        value,
    });
}

pub fn program(log: &Log) -> Program<Nv> {
    let (la, lb, lc) = (Rc::clone(log), Rc::clone(log), Rc::clone(log));
    Program::builder()
        .task(A, "a", move |cx: TaskCtx<'_, Nv>| {
            let nv = cx.nv();
            let count = cx.sync_or::<u32>(0, &[&nv.count.n]);
            let _seen = cx.sync_or::<u32>(0, &[nv.report.total.leg(LEG_A), &nv.ack.total]);
            note(&la, &cx, count);
            cx.out(count + 1, &[&nv.count.n]);
            cx.checkpoint("a: counted");
            cx.out(count + 1, &[&nv.tick.n]);
            cx.transition_to(B)
        })
        .task(B, "b", move |cx: TaskCtx<'_, Nv>| {
            let nv = cx.nv();
            let tick = cx.sync::<u32>(&[&nv.tick.at(|d| &d.n)]);
            let total = cx.sync_or::<u32>(0, &[&nv.sum.total]) + tick;
            note(&lb, &cx, total);
            cx.out(total, &[&nv.sum.total, &nv.report.at(|d| &d.total)]);
            if tick % 2 == 0 {
                cx.transition_to(C)
            } else {
                cx.transition_to(A)
            }
        })
        .task(C, "c", move |cx: TaskCtx<'_, Nv>| {
            let nv = cx.nv();
            let total = cx.sync::<u32>(&[nv.report.total.leg(LEG_C)]);
            note(&lc, &cx, total);
            cx.out(total, &[&nv.ack.total]);
            cx.transition_to(A)
        })
        .entry(A)
        .build()
        .expect("relay program is valid")
}

/// A predicate that stops the run on entry into the activation at `time`,
/// after its prologue.
pub fn entering(time: u64) -> impl Fn(&Probe) -> bool {
    move |p: &Probe| p.boundary == Boundary::TaskEntry && p.time == LogicalTime::new(time)
}

/// Everything the program has stored, for comparing runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub active: Activation,
    pub count: [Stamped<u32>; 2],
    pub count_swap: SwapState,
    pub tick: Stamped<u32>,
    pub sum: [Stamped<u32>; 2],
    pub sum_swap: SwapState,
    pub report: [Stamped<u32>; 2],
    pub ack: Stamped<u32>,
    pub last_attempt: [LogicalTime; 3],
}

impl Snapshot {
    pub fn of(nv: &Nv) -> Self {
        Self {
            active: nv.chain.active(),
            count: [nv.count.n.stamped(), nv.count.n.staged()],
            count_swap: nv.count.n.swap_state(),
            tick: nv.tick.n.stamped(),
            sum: [nv.sum.total.stamped(), nv.sum.total.staged()],
            sum_swap: nv.sum.total.swap_state(),
            report: [
                nv.report.total.leg(0).stamped(),
                nv.report.total.leg(1).stamped(),
            ],
            ack: nv.ack.total.stamped(),
            last_attempt: [A, B, C].map(|t| nv.chain.task(t).last_attempt()),
        }
    }
}
