//! Tracing setup for the binary. Logs always go to stderr; stdout belongs to
//! the response stream in `serve` mode.

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::Config;

/// Install the global subscriber. `RUST_LOG` wins over the configured `LOG_LEVEL`.
pub fn init_tracing(cfg: &Config, verbose: bool) {
    let level = if verbose {
        "sandbox_worker=debug".to_string()
    } else {
        cfg.get("LOG_LEVEL").unwrap_or_else(|| "sandbox_worker=info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if cfg.get_bool("LOG_JSON") {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()
    };
}
