//! Tracing subscriber setup.

use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. When a log directory is
/// configured, output rolls daily into `mailroom.log.*` files; otherwise
/// it goes to stderr. The returned guard must be held for the lifetime of
/// the process so buffered file output is flushed on shutdown.
pub fn init(log: &LogConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));

    match &log.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "mailroom.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
