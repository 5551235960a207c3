//! Tracing subscriber setup. Human-readable logs go to stderr; the level
//! comes from `RUST_LOG` (default `info`). Structured crawl events go
//! through the metrics stream instead, so stdout stays clean for
//! `checkpoint --status` output.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();

    // Tests may initialize more than once; that is fine.
    if let Err(e) = result {
        tracing::debug!("logging already initialized: {e}");
    }
}
