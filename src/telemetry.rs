//! Tracing setup for harnesses and embedding binaries.

use tracing_subscriber::EnvFilter;

/// Initialize a global subscriber with an env-overridable filter.
///
/// The `LOG` environment variable takes precedence over `verbosity`
/// (0 = warn, 1 = info, 2 = debug, 3+ = trace). Safe to call more than
/// once; later calls are no-ops.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}
