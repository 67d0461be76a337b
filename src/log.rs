//! Module with the logging helpers used across the crate.
//!
//! Messages are usually built with `color_print::cformat!` at the call site and
//! forwarded to `tracing`, so the subscriber installed by the binary decides
//! where they end up.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Function that installs the default subscriber (`RUST_LOG` or `info`).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // a second call (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}

pub fn debug(msg: &str) {
    tracing::debug!("{msg}");
}

pub fn info(msg: &str) {
    tracing::info!("{msg}");
}

pub fn warn(msg: &str) {
    tracing::warn!("{msg}");
}

pub fn error(msg: &str) {
    tracing::error!("{msg}");
}
