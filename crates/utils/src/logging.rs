//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable holding an optional log file path, e.g. `/var/log/gpu-plugin/plugin.log`
pub const LOG_PATH_ENV_VAR: &str = "GPU_PLUGIN_LOG_PATH";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Splits a log file path into the directory and the file name prefix used
/// by the rolling appender.
fn split_log_path(log_path: &Path) -> Option<(&Path, &str)> {
    let file = log_path.file_name()?.to_str()?;
    let dir = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Some((dir, file))
}

/// initiate the global tracing subscriber
///
/// Always logs to stderr. When `log_path` is given, events are also written to a
/// daily rotated file next to it; the returned guard must be kept alive to flush it.
pub fn init<P: AsRef<Path>>(log_path: Option<P>) -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let file_parts = log_path
        .as_ref()
        .and_then(|p| split_log_path(p.as_ref()))
        .and_then(|(dir, file)| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(file)
                .max_log_files(3)
                .build(dir)
                .map_err(|e| eprintln!("failed to create rolling file appender: {e}"))
                .ok()
        })
        .map(tracing_appender::non_blocking);

    match file_parts {
        Some((file_writer, guard)) => {
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter());
            registry().with(stderr_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            registry().with(stderr_layer).init();
            None
        }
    }
}
