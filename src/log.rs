//! Installation of the `tracing` subscriber used by the binary and tests.
//!
//! Passes log through the `tracing` macros only; whoever embeds the
//! library decides where the events go. `RUST_LOG` always wins over the
//! verbosity picked on the command line.

use tracing_subscriber::{fmt, EnvFilter};

/// Level directive for a `-v` count: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
pub fn directive_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn build_filter(verbosity: u8) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(directive_for(verbosity)),
    }
}

/// Install a stderr formatter. Returns false when a subscriber was already set.
pub fn init(verbosity: u8) -> bool {
    fmt()
        .with_env_filter(build_filter(verbosity))
        .with_target(verbosity >= 2)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Subscriber for unit tests: output captured by the test harness.
pub fn init_for_tests() {
    let _ = fmt()
        .with_env_filter(build_filter(2))
        .with_test_writer()
        .try_init();
}
