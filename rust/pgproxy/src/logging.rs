//! Structured logging setup. `--verbosity` supplies the default
//! `EnvFilter` directive; `RUST_LOG` still overrides it, same as any
//! other `tracing-subscriber` binary.

use tracing_subscriber::EnvFilter;

use crate::config::Verbosity;

pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.as_filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
