//! Tracing subscriber setup shared by the two binaries.
//!
//! Diagnostics go to stderr; when a log file is configured, a second
//! daily-rolling layer writes there through a non-blocking appender. The
//! returned guard must stay alive for the life of the process or buffered
//! file output is lost.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// Initialise logging from the configured level, an optional log file and
/// the `-v` count (which overrides the configured level).
pub fn init(level: &str, log_file: Option<&Path>, verbose: u8) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO),
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(level)
        .boxed();

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("smq.log"));
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .ok();
    guard
}
