//! Tiny logging seam the rest of the engine logs through.
//!
//! The core deliberately does not own a "comprehensive" logging backend --
//! rotation, redaction and file sinks are a host-application concern. `LogSink`
//! is the contract every component calls through; [`TracingSink`] is the
//! default implementation, backed by `tracing` the way the rest of this
//! crate's idiom does for every other ambient concern.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, target: &str, message: &str);

    fn debug(&self, target: &str, message: &str) {
        self.log(LogLevel::Debug, target, message);
    }
    fn info(&self, target: &str, message: &str) {
        self.log(LogLevel::Info, target, message);
    }
    fn warn(&self, target: &str, message: &str) {
        self.log(LogLevel::Warn, target, message);
    }
    fn error(&self, target: &str, message: &str) {
        self.log(LogLevel::Error, target, message);
    }
}

/// Discards everything. Used by default in tests and by library consumers who
/// never initialize a `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: LogLevel, _target: &str, _message: &str) {}
}

/// Forwards to `tracing`. The crate's default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, target: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "engine", component = target, "{}", message),
            LogLevel::Info => tracing::info!(target: "engine", component = target, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "engine", component = target, "{}", message),
            LogLevel::Error => tracing::error!(target: "engine", component = target, "{}", message),
        }
    }
}

pub fn default_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingSink)
}

/// Installs a `tracing_subscriber` fmt layer honoring `RUST_LOG`/`NETMON_LOG`.
/// Idempotent: safe to call more than once (subsequent calls are no-ops).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("NETMON_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
