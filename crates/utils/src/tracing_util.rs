//! Helpers related to tracing, used by main entrypoints.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. `default_directive` applies
/// when `RUST_LOG` is unset; diagnostics go to stderr so that command
/// output on stdout stays machine-consumable.
pub fn initialize_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
