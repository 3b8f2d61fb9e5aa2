//! Structured logging setup: an `EnvFilter`-driven `tracing-subscriber`
//! layer plus a panic hook that routes panics through `tracing` instead of
//! stderr, so a panic in a spawned task shows up in the same log stream
//! as everything else.

use tracing_subscriber::EnvFilter;

/// Drop-guard returned by [`init`]. Currently a marker; kept so callers
/// hold something for the lifetime of the process and a future flushed
/// writer (e.g. `tracing-appender`) can be introduced without changing
/// the call site.
pub struct LoggingGuard;

pub fn init() -> LoggingGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "panic");
    }));

    LoggingGuard
}
