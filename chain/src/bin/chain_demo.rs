//! Simulated intermittently-powered sensor node.
//!
//! Runs a three-task chain program over an image kept in POSIX shared
//! memory. Each boot gets a random energy budget and ends with a power
//! failure; the next boot, in this process or a later one, resumes from the
//! image.
//!
//! # Usage
//!
//! ```sh
//! chain-demo --boots 20 --min-draws 5 --max-draws 80 --verbose
//! ```
//!
//! Killing the process at any point and starting it again continues the
//! same run.
//!
//! # Program
//!
//! ```text
//!   count ──► tick ──► total ──► report
//!   (a, self)  (a→b)   (b, self)  (b→mc: c, a)
//!
//!   a: count += 1, send tick = count and the freshest total seen to b
//!   b: total += tick, multicast total; every third tick go to c, else a
//!   c: count reports, acknowledge total back to a
//! ```

use chain::channel::{Channel, Field, Multicast, SelfField};
use chain::config::DeviceConfig;
use chain::engine::{ChainState, SelfFieldRegistry};
use chain::nvm::{BootKind, Fram, FramError, Retained};
use chain::{
    ChainError, Device, NonVolatile, Persistent, Program, TaskCtx, TaskId, Transition,
};

const SENSE: TaskId = TaskId::new(0);
const SUM: TaskId = TaskId::new(1);
const REPORT: TaskId = TaskId::new(2);

/// Multicast leg read by `report`.
const LEG_REPORT: usize = 0;
/// Multicast leg read by `sense`.
const LEG_SENSE: usize = 1;

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("invalid argument: {0}")]
    Args(String),

    #[error(transparent)]
    Fram(#[from] FramError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(NonVolatile, Default)]
#[repr(C)]
struct Counter {
    count: SelfField<u32>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
struct Tick {
    tick: Field<u32>,
    observed: Field<u64>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
struct Total {
    total: SelfField<u64>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
struct Totals {
    total: Multicast<u64, 2>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
struct Reports {
    reports: SelfField<u32>,
}

#[derive(NonVolatile, Default)]
#[repr(C)]
struct Ack {
    total: Field<u64>,
}

#[derive(NonVolatile)]
#[repr(C)]
struct Nv {
    chain: ChainState,
    counter: Channel<Counter>,
    ticks: Channel<Tick>,
    total: Channel<Total>,
    totals: Channel<Totals>,
    reports: Channel<Reports>,
    ack: Channel<Ack>,
}

impl Default for Nv {
    fn default() -> Self {
        Self {
            chain: ChainState::default(),
            counter: Channel::self_channel("sense", Counter::default()),
            ticks: Channel::task("sense", "sum", Tick::default()),
            total: Channel::self_channel("sum", Total::default()),
            totals: Channel::multicast("totals", "sum", Totals::default()),
            reports: Channel::self_channel("report", Reports::default()),
            ack: Channel::task("report", "sense", Ack::default()),
        }
    }
}

impl Persistent for Nv {
    fn chain(&self) -> &ChainState {
        &self.chain
    }

    fn register<'a>(&'a self, registry: &mut SelfFieldRegistry<'a>) -> Result<(), ChainError> {
        registry.register(SENSE, &self.counter.count)?;
        registry.register(SUM, &self.total.total)?;
        registry.register(REPORT, &self.reports.reports)?;
        Ok(())
    }
}

fn sense(cx: TaskCtx<'_, Nv>) -> Transition {
    let nv = cx.nv();
    let count = cx.sync_or::<u32>(0, &[&nv.counter.count]) + 1;
    // Two producers feed the total back: `sum` directly and `report` by
    // acknowledgement. The later write wins.
    let observed = cx.sync_or::<u64>(0, &[nv.totals.total.leg(LEG_SENSE), &nv.ack.total]);
    cx.checkpoint("sampled");
    cx.out(count, &[&nv.counter.count]);
    cx.out(count, &[&nv.ticks.at(|d| &d.tick)]);
    cx.out(observed, &[&nv.ticks.observed]);
    cx.transition_to(SUM)
}

fn sum(cx: TaskCtx<'_, Nv>) -> Transition {
    let nv = cx.nv();
    let tick = cx.sync::<u32>(&[&nv.ticks.at(|d| &d.tick)]);
    let total = cx.sync_or::<u64>(0, &[&nv.total.total]) + u64::from(tick);
    cx.out(total, &[&nv.total.total, &nv.totals.at(|d| &d.total)]);
    if tick % 3 == 0 {
        cx.transition_to(REPORT)
    } else {
        cx.transition_to(SENSE)
    }
}

fn report(cx: TaskCtx<'_, Nv>) -> Transition {
    let nv = cx.nv();
    let total = cx.sync::<u64>(&[nv.totals.total.leg(LEG_REPORT)]);
    let reports = cx.sync_or::<u32>(0, &[&nv.reports.reports]) + 1;
    cx.out(reports, &[&nv.reports.reports]);
    cx.out(total, &[&nv.ack.at(|d| &d.total)]);
    cx.transition_to(SENSE)
}

fn program() -> Result<Program<Nv>, ChainError> {
    Program::builder()
        .task(SENSE, "sense", sense)
        .task(SUM, "sum", sum)
        .task(REPORT, "report", report)
        .entry(SENSE)
        .build()
}

fn main() {
    if let Err(e) = run() {
        eprintln!("chain-demo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), DemoError> {
    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args)?;
    chain::init_tracing();

    let path = config.image_path()?;
    if config.fresh {
        Fram::<Nv, Retained>::erase(&path)?;
    }
    let (fram, kind) = Fram::<Nv, Retained>::boot(&path)?;
    match kind {
        BootKind::Cold => eprintln!("chain-demo: formatted new image {path}"),
        BootKind::Warm => eprintln!("chain-demo: resuming image {path}"),
    }

    let device = Device::new(program()?, &*fram);
    let mut supply = config.harvester();
    for _ in 0..config.boots {
        let report = device.power_on(&mut supply)?;
        if config.verbose {
            eprintln!("chain-demo: {report}");
        }
    }

    print_summary(&device);
    Ok(())
}

fn print_summary(device: &Device<'_, Nv>) {
    let nv = device.image();
    let state = device.state();
    let active = state.active();
    let tick = nv.ticks.tick.value();
    let total = nv.totals.total.leg(LEG_SENSE).value();
    let triangle = |n: u64| n * (n + 1) / 2;
    let k = u64::from(tick);
    // `sum` has either consumed the last tick or not yet run for it.
    let consistent = total == triangle(k) || total == triangle(k.saturating_sub(1));

    println!("boots:       {}", state.boots());
    println!("active:      {} ({})", active, device.program().name(active.task));
    println!("transitions: {}", state.committed_transitions());
    println!("last tick:   {tick}");
    println!("total:       {total}");
    println!("reports:     {}", nv.reports.reports.stamped().value);
    println!("acked total: {}", nv.ack.total.value());
    println!("seen by a:   {}", nv.ticks.observed.value());
    println!("consistent:  {}", if consistent { "yes" } else { "NO" });
}

/// Parses command line arguments into a DeviceConfig.
fn parse_args(args: &[String]) -> Result<DeviceConfig, DemoError> {
    let mut config = DeviceConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--image" | "-i" => {
                config.image = value(args, &mut i)?.to_owned();
            }
            "--boots" | "-b" => {
                config.boots = parse_value(args, &mut i)?;
            }
            "--min-draws" => {
                config.min_draws = parse_value(args, &mut i)?;
            }
            "--max-draws" => {
                config.max_draws = parse_value(args, &mut i)?;
            }
            "--seed" | "-s" => {
                config.seed = Some(parse_value(args, &mut i)?);
            }
            "--fresh" => config.fresh = true,
            "--verbose" | "-v" => config.verbose = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => {
                return Err(DemoError::Args(format!("unknown argument: {arg}")));
            }
        }
        i += 1;
    }

    if config.min_draws > config.max_draws {
        return Err(DemoError::Args(format!(
            "--min-draws {} exceeds --max-draws {}",
            config.min_draws, config.max_draws
        )));
    }

    Ok(config)
}

fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, DemoError> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| DemoError::Args(format!("missing value for {flag}")))
}

fn parse_value<T>(args: &[String], i: &mut usize) -> Result<T, DemoError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let flag = args[*i].clone();
    let raw = value(args, i)?;
    raw.parse()
        .map_err(|e| DemoError::Args(format!("{flag} {raw}: {e}")))
}

fn print_usage() {
    eprintln!(
        r#"chain-demo - intermittently-powered sensor node simulation

USAGE:
    chain-demo [OPTIONS]

OPTIONS:
    -i, --image <PATH>      Shared memory object holding the image (default: /chain-demo)
    -b, --boots <N>         Boots to run (default: 8)
        --min-draws <N>     Smallest energy budget per boot (default: 10)
        --max-draws <N>     Largest energy budget per boot (default: 120)
    -s, --seed <N>          Seed for the energy harvester (default: random)
        --fresh             Erase the image before booting
    -v, --verbose           Print a report after every boot
    -h, --help              Print this help message

EXAMPLE:
    chain-demo --fresh --boots 50 --seed 7
    chain-demo --image /node-2 --verbose
"#
    );
}
