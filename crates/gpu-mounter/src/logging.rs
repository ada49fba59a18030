//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

pub const DEFAULT_LOG_FILE: &str = "/var/log/GPUMounter/GPUMounter-worker.log";
const MAX_LOG_FILES: usize = 3;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Splits a log file path into its directory and file name prefix.
fn split_log_path(log_file: &Path) -> Result<(&Path, &str)> {
    let file = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("log file {} has no file name", log_file.display()))?;
    let dir = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Ok((dir, file))
}

/// initiate the global tracing subscriber
///
/// Events go to stderr and to a daily rolled file next to `log_file`.
pub fn init(log_file: &Path) -> Result<WorkerGuard> {
    let (dir, file) = split_log_path(log_file)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .context("failed to create rolling file appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter());

    registry()
        .with(utils::logging::get_fmt_layer().with_filter(env_filter()))
        .with(file_layer)
        .init();
    Ok(file_guard)
}
