//! Logging initialisation for virt-provision.
//!
//! When the `VIRT_PROVISION_LOG` environment variable is set to `1`,
//! structured logs are also written to
//! `$XDG_DATA_HOME/virt-provision/virt-provision.log`. Otherwise only stderr
//! output (filtered by `RUST_LOG`, default `info`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const APP_NAME: &str = "virt-provision";
const LOG_FILE: &str = "virt-provision.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main` and keep the returned `LogGuard` alive.
pub fn init() -> LogGuard {
    let file_guard = if file_logging_enabled() {
        let dir = log_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn file_logging_enabled() -> bool {
    std::env::var("VIRT_PROVISION_LOG").as_deref() == Ok("1")
}

/// `$XDG_DATA_HOME/virt-provision`, falling back to `~/.local/share`.
pub fn log_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join(APP_NAME));
        }
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".local").join("share").join(APP_NAME))
}
