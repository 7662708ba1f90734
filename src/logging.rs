use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to stderr so stdout stays clean
/// for replies. `info` by default; with `verbose` the level is `debug` and
/// `RUST_LOG` may override it.
pub fn init(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
