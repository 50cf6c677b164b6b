//! Logging setup: stderr always, plus an optional daily-rolling file.

use std::path::Path;

use loom_core::config::env_flag;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEBUG_LOG_ENV: &str = "LOOM_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "loom-replay.log";

/// Installs the global subscriber. Keep the returned guard alive until exit or
/// buffered file output is lost.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_writer = log_dir.and_then(|dir| {
        match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .build(dir)
        {
            Ok(appender) => Some(tracing_appender::non_blocking(appender)),
            Err(err) => {
                eprintln!(
                    "loom-replay: file logging disabled ({}): {}",
                    dir.display(),
                    err
                );
                None
            }
        }
    });

    match file_writer {
        Some((writer, guard)) => {
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}

fn env_filter() -> EnvFilter {
    if env_flag(DEBUG_LOG_ENV) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
