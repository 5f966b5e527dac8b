//! Logging initialization for hosts and tests.
//!
//! The library itself only emits `tracing` events; installing a
//! subscriber is the host's decision.

use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber. The `FROND_LOG` environment
/// variable overrides the verbosity-derived default. Safe to call more
/// than once; later calls are no-ops.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("FROND_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}
