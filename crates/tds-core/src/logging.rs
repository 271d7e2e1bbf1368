//! Logging initialization using the `tracing` ecosystem.
//!
//! Console output is always on. When a log directory is given, a second layer
//! writes through a non-blocking daily-rotating appender so that slow disks
//! never stall the dispatcher task. `RUST_LOG` overrides the configured level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, colored on the console.
    #[default]
    Text,
    /// One JSON object per line (for log shippers).
    Json,
}

/// Options for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogOptions<'a> {
    /// Default filter when `RUST_LOG` is unset (e.g. `"info"` or `"tds_stream=debug"`).
    pub level: &'a str,
    /// Directory for daily-rotating log files; `None` disables file output.
    pub dir: Option<&'a str>,
    /// File name prefix for rotated files.
    pub module_name: &'a str,
    pub format: LogFormat,
}

/// Install the global tracing subscriber.
///
/// Call once at program start. The returned guard flushes the file writer on
/// drop and must be held for the lifetime of the process.
pub fn init_logging(opts: &LogOptions<'_>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.level));

    let console_layer = match opts.format {
        LogFormat::Text => fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_target(true).with_thread_ids(true).boxed(),
    };

    let (file_layer, guard) = match opts.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, opts.module_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true).with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(env_filter).with(console_layer).with(file_layer).init();

    guard
}
