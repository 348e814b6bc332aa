//! Tracing setup shared by all module executables.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber from the `LOGLEVEL` value (`DEBUG`,
/// `INFO`, ...). An explicit `RUST_LOG` in the environment takes precedence
/// so targeted filters keep working.
pub fn init(loglevel: &str) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(loglevel.to_ascii_lowercase()),
    };

    // A second init (tests, embedded use) is not an error worth dying for.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}
