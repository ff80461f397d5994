//! Recovery properties of the relay program under injected power failures.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chain::channel::{Channel, Field, SelfField};
use chain::engine::{ChainState, SelfFieldRegistry};
use chain::power::{Boundary, Brownout, Harvester, Mains, Outage, Probe};
use chain::{
    ChainError, Device, LogicalTime, NonVolatile, Persistent, Program, TaskCtx, TaskId,
};

use common::{A, B, C, LEG_A, LEG_C, Nv, Seen, Snapshot, entering, log, program};

fn run_clean(until: u64) -> Snapshot {
    let image = Nv::default();
    let device = Device::new(program(&log()), &image);
    device.power_on(&mut Outage::when(entering(until))).unwrap();
    Snapshot::of(&image)
}

#[test]
fn time_advances_by_one_per_commit() {
    let image = Nv::default();
    let log = log();
    let device = Device::new(program(&log), &image);

    let mut supply = Harvester::seeded(11, 3, 40);
    device.power_cycle(&mut supply, 300).unwrap();

    let times: Vec<u64> = log.borrow().iter().map(|s| s.time.get()).collect();
    assert!(!times.is_empty());
    assert_eq!(times[0], 1);
    for pair in times.windows(2) {
        assert!(
            pair[1] == pair[0] || pair[1] == pair[0] + 1,
            "time jumped from {} to {}",
            pair[0],
            pair[1]
        );
    }
    let active = device.state().active().time.get();
    assert!(active >= *times.last().unwrap());
    assert_eq!(device.state().committed_transitions(), active);
}

#[test]
fn retries_of_an_activation_see_the_same_state() {
    let image = Nv::default();
    let log = log();
    let device = Device::new(program(&log), &image);

    device.power_cycle(&mut Brownout::every(23), 400).unwrap();

    // Group the attempts of `a` by activation.
    let attempts: Vec<Seen> = log.borrow().iter().copied().filter(|s| s.task == A).collect();
    let mut activations: Vec<(LogicalTime, u32)> = Vec::new();
    for seen in &attempts {
        match activations.last() {
            Some(&(time, count)) if time == seen.time => {
                assert_eq!(count, seen.value, "retry of a@{time} saw another count");
            }
            _ => activations.push((seen.time, seen.value)),
        }
    }

    let counts: Vec<u32> = activations.iter().map(|&(_, count)| count).collect();
    let expected: Vec<u32> = (0..counts.len() as u32).collect();
    assert!(counts.len() > 3);
    assert_eq!(counts, expected);
}

#[test]
fn self_swap_commits_exactly_once_whatever_the_prologue_crash() {
    let clean = run_clean(6);
    let boundaries = [
        Boundary::PrologueFlip,
        Boundary::DirtyReset,
        Boundary::LastAttempt,
        Boundary::TaskEntry,
    ];

    for boundary in boundaries {
        let image = Nv::default();
        let device = Device::new(program(&log()), &image);

        // a@3 is the first activation whose prologue applies a swap.
        let mut crash = Outage::when(move |p: &Probe| {
            p.boundary == boundary && p.task == A && p.time == LogicalTime::new(3)
        });
        let report = device.power_on(&mut crash).unwrap();
        assert_eq!(report.failure.probe.boundary, boundary);

        device.power_on(&mut Outage::when(entering(6))).unwrap();
        assert_eq!(Snapshot::of(&image), clean, "crash before {boundary}");
    }
}

#[test]
fn prologue_rerun_is_idempotent() {
    let image = Nv::default();
    let device = Device::new(program(&log()), &image);

    // Stop right after a@3's prologue, then boot again several times, each
    // time failing on entry: every boot re-runs the prologue for a@3.
    device.power_on(&mut Outage::when(entering(3))).unwrap();
    let after_first = Snapshot::of(&image);
    for _ in 0..4 {
        device.power_on(&mut Outage::when(entering(3))).unwrap();
        assert_eq!(Snapshot::of(&image), after_first);
    }
    assert_eq!(image.count.n.stamped().value, 1);
}

#[test]
fn each_producer_stamps_its_own_writes() {
    let image = Nv::default();
    let device = Device::new(program(&log()), &image);

    // a@1 (tick 1) -> b@2 (odd) -> a@3 (tick 2) -> b@4 (even) -> c@5 -> a@6
    device.power_on(&mut Outage::when(entering(6))).unwrap();

    let from_b = image.report.total.leg(LEG_A).stamped();
    let from_c = image.ack.total.stamped();
    assert_eq!(from_b.time, LogicalTime::new(4));
    assert_eq!(from_c.time, LogicalTime::new(5));
    assert_eq!(from_b.value, 3);
    assert_eq!(from_c.value, 3);
    assert_eq!(image.report.total.leg(LEG_C).stamped(), from_b);
}

#[test]
fn multicast_writes_every_leg() {
    let clean = run_clean(5);
    assert_eq!(clean.report[0], clean.report[1]);
    assert_eq!(clean.report[0].time, LogicalTime::new(4));
    assert_eq!(clean.tick.value, 2);
    assert_eq!(clean.active.task, C);
    assert_eq!(clean.last_attempt[B.index()], LogicalTime::new(4));
}

// A task that is deliberately not idempotent: it records the boot number in
// its self field. Abandoned attempts must never leak into later reads.
#[derive(NonVolatile, Default)]
#[repr(C)]
struct Mark {
    boot: SelfField<u64>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
struct Echo {
    boot: Field<u64>,
}

#[derive(NonVolatile)]
#[repr(C)]
struct MarkNv {
    chain: ChainState,
    mark: Channel<Mark>,
    echo: Channel<Echo>,
}

impl Persistent for MarkNv {
    fn chain(&self) -> &ChainState {
        &self.chain
    }

    fn register<'a>(&'a self, registry: &mut SelfFieldRegistry<'a>) -> Result<(), ChainError> {
        registry.register(TaskId::new(0), &self.mark.boot)?;
        Ok(())
    }
}

#[test]
fn abandoned_self_write_is_never_observed() {
    const MARK: TaskId = TaskId::new(0);
    const ECHO: TaskId = TaskId::new(1);

    let image = MarkNv {
        chain: ChainState::default(),
        mark: Channel::self_channel("mark", Mark::default()),
        echo: Channel::task("mark", "echo", Echo::default()),
    };
    let reads: Rc<RefCell<Vec<(u64, u64)>>> = Rc::default();
    let seen = Rc::clone(&reads);
    let program = Program::builder()
        .task(MARK, "mark", move |cx: TaskCtx<'_, MarkNv>| {
            let nv = cx.nv();
            let last = cx.sync_or::<u64>(0, &[&nv.mark.boot]);
            seen.borrow_mut().push((cx.time().get(), last));
            cx.out(cx.boots(), &[&nv.mark.boot]);
            cx.out(cx.boots(), &[&nv.echo.boot]);
            cx.checkpoint("mark: written");
            cx.transition_to(ECHO)
        })
        .task(ECHO, "echo", |cx: TaskCtx<'_, MarkNv>| {
            let _ = cx.sync::<u64>(&[&cx.nv().echo.boot]);
            cx.transition_to(MARK)
        })
        .entry(MARK)
        .build()
        .unwrap();
    let device = Device::new(program, &image);

    // Boot 1: mark@1 writes 1 and is lost before its transition.
    let mut lose_first = Outage::when(|p: &Probe| p.label == Some("mark: written"));
    device.power_on(&mut lose_first).unwrap();
    assert_eq!(image.mark.boot.staged().value, 1);

    // Boot 2: the retry of mark@1 must not see its lost write. It writes 2,
    // which mark@3 then reads.
    device.power_on(&mut Outage::when(entering(4))).unwrap();
    assert_eq!(*reads.borrow(), [(1, 0), (1, 0), (3, 2)]);
    assert_eq!(image.echo.boot.value(), 2);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "no producer")]
fn reading_a_never_written_field_is_a_contract_violation() {
    #[derive(NonVolatile)]
    #[repr(C)]
    struct Lonely {
        chain: ChainState,
        a: Field<u8>,
        b: Field<u8>,
        c: Field<u8>,
    }

    impl Persistent for Lonely {
        fn chain(&self) -> &ChainState {
            &self.chain
        }
    }

    let image = Lonely {
        chain: ChainState::default(),
        a: Field::default(),
        b: Field::default(),
        c: Field::default(),
    };
    let program = Program::builder()
        .task(TaskId::new(0), "reader", |cx: TaskCtx<'_, Lonely>| {
            let nv = cx.nv();
            let _ = cx.sync::<u8>(&[&nv.a, &nv.b, &nv.c]);
            let me = cx.task();
            cx.transition_to(me)
        })
        .entry(TaskId::new(0))
        .build()
        .unwrap();
    let _ = Device::new(program, &image).power_on(&mut Mains);
}

#[test]
fn boot_hook_runs_before_any_task() {
    let image = Nv::default();
    let order = Rc::new(Cell::new(0u32));
    let hook_order = Rc::clone(&order);
    let entered = Rc::new(Cell::new(false));
    let flag = Rc::clone(&entered);
    let program = Program::builder()
        .task(A, "a", move |cx: TaskCtx<'_, Nv>| {
            flag.set(true);
            let nv = cx.nv();
            let count = cx.sync_or::<u32>(0, &[&nv.count.n]);
            cx.out(count + 1, &[&nv.count.n]);
            cx.transition_to(A)
        })
        .task(B, "b", |cx: TaskCtx<'_, Nv>| cx.transition_to(A))
        .entry(A)
        .on_boot(move || {
            hook_order.set(hook_order.get() + 1);
        })
        .build()
        .unwrap();
    let device = Device::new(program, &image);

    // Fail on the very first draw: the hook ran, no task did.
    device.power_on(&mut Brownout::every(1)).unwrap();
    assert_eq!(order.get(), 1);
    assert!(!entered.get());
    assert_eq!(device.state().boots(), 0);

    device.power_on(&mut Brownout::every(30)).unwrap();
    assert_eq!(order.get(), 2);
    assert!(entered.get());
    assert_eq!(device.state().boots(), 1);
}
