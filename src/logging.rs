//! Subscriber setup for binaries that drive the engine.

use std::io::IsTerminal;

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Installs a global subscriber that logs to stderr.
///
/// Events are filtered by `RUST_LOG`, defaulting to `info`. Log lines are
/// printed above the build progress bar instead of tearing through it. Fails
/// if a global subscriber is already set.
pub fn init() -> Result<(), TryInitError> {
    let indicatif = IndicatifLayer::new();
    let verbose = std::env::var_os("RUST_LOG").is_some();

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let fmt = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(verbose)
        .with_writer(indicatif.get_stderr_writer())
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(fmt)
        .with(indicatif)
        .try_init()
}
