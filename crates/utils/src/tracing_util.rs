//! Helpers related to tracing, used by all binaries.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber writing to stderr.
///
/// `level` is a log-level name (`trace` through `error`); an invalid
/// value falls back to `error`. Timestamps are omitted, matching the
/// terse single-line style the CLI expects.
pub fn initialize_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("error"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .compact()
        .init();
}
