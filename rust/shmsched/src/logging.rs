use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable holding the log filter, in `EnvFilter` syntax.
pub const LOG_ENV: &str = "SHMSCHED_LOG";
pub const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber: events to stderr, filtered by `filter`
/// (or [`DEFAULT_FILTER`] if it does not parse).
///
/// Safe to call more than once; later calls are ignored.
pub fn init(filter: Option<&str>) {
    let filter = filter
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .try_init();
}
