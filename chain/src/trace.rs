//! Tracing for following boots, transitions and channel traffic.
//!
//! Enable with `--features tracing`. Without the feature every event macro
//! expands to nothing, so tasks running between power failures pay nothing
//! for diagnostics.
//!
//! | Level | Events |
//! |-------|--------|
//! | `info` | boot start, image format |
//! | `debug` | resume, transition commit, boot end |
//! | `trace` | prologue branch, task entry, `sync` choice, `out` |
//! | `warn` | power failure, stale dirty-list entry |

/// Installs a `tracing` subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG`, defaulting to `chain=trace`. Calling it
/// again, or after another subscriber was installed, does nothing. Without
/// the `tracing` feature the function is a no-op.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chain=trace"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! event_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use event_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use event_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use event_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use event_noop as warn;
