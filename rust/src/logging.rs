use tracing_subscriber::EnvFilter;

/// Installs the process-wide fmt subscriber. `RUST_LOG` wins over the default `info` filter.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
