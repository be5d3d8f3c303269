//! Logging initialisation for gpu-partitioner.
//!
//! When the `GPU_PARTITIONER_LOG` environment variable is set to `1`,
//! structured logs are also written to `gpu-partitioner.log` in the
//! application log directory. Otherwise only stderr output (filtered by
//! `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::AppPaths;

pub const LOG_ENV_VAR: &str = "GPU_PARTITIONER_LOG";
pub const LOG_FILE_NAME: &str = "gpu-partitioner.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn file_logging_enabled() -> bool {
    std::env::var(LOG_ENV_VAR).as_deref() == Ok("1")
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init() -> LogGuard {
    let file_guard = if file_logging_enabled() {
        let dir = log_dir();
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn log_dir() -> PathBuf {
    AppPaths::resolve()
        .map(|p| p.logs)
        .unwrap_or_else(std::env::temp_dir)
}
