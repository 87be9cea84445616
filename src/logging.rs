//! Log setup for binaries
//!
//! The library only emits `tracing` events. Binaries call [`init_logging`] once at startup to print them.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stderr subscriber
///
/// `verbosity` picks the level for this crate: 0=error, 1=warn, 2=info, 3=debug, 4+=trace. `RUST_LOG` overrides it
/// when set.
///
/// # Errors
/// Fails if a global subscriber was already installed.
pub fn init_logging(verbosity: u8) -> Result<(), tracing_subscriber::util::TryInitError> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tun_capture={level},capture={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
}
