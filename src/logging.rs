use std::env;
use std::ffi::OsStr;
use std::path::Path;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Pretty stdout logging, plus a plain file layer when `log_file` is given.
/// The returned guard flushes the file writer when dropped.
pub fn init_logger(level: Option<&str>, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = level
        .map(str::to_string)
        .or_else(|| env::var("TRACING_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter_layer = EnvFilter::new(filter.to_lowercase());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .unwrap_or_else(|| OsStr::new("snapmover.log"));
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (
                Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .pretty()
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter_layer)
        .init();

    debug!("Tracing configured (file logging: {})", guard.is_some());

    guard
}
