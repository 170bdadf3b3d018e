//! Structured logging setup, extracted from the process bootstrap so
//! library consumers (and the demo binary) share one implementation.

use colored::*;
use std::fmt;
use std::path::PathBuf;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, Layer};

/// A custom tracing event formatter for colorizing log output based on level.
///
/// Produces clean, user-facing output where the entire log line is colored
/// according to its severity level, without timestamps or level prefixes.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        let mut buffer = String::new();
        let buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer, event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Verbosity level requested by a caller (e.g. a `-v` repeat count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Info,
    Debug,
    Trace,
}

impl From<Verbosity> for LevelFilter {
    fn from(v: Verbosity) -> Self {
        match v {
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

/// Where the detailed (non-colorized) log layer is written.
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Write detailed logs to stderr, uncolored.
    Stderr,
    /// Write detailed logs to a daily-rolling file under `directory` named
    /// `file_name`.
    File { directory: PathBuf, file_name: String },
}

/// Logging configuration consumed by [`init_logging`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub verbosity: Verbosity,
    pub target: LogTarget,
    /// Suppress the colorized stdout layer (useful for scripted runs).
    pub quiet: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Info,
            target: LogTarget::Stderr,
            quiet: false,
        }
    }
}

/// Guard returned by [`init_logging`]. Drop it only on process exit; while
/// using a file target, dropping it early stops the non-blocking writer
/// from flushing.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

/// Initialize the global tracing subscriber: a colorized stdout layer
/// (unless `quiet`) plus a detailed layer written to stderr or a rolling
/// file, both filtered to the requested verbosity.
pub fn init_logging(config: LoggingConfig) -> LoggingGuard {
    let level: LevelFilter = config.verbosity.into();

    let (detailed_layer, guard) = match config.target {
        LogTarget::Stderr => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(level)
                .boxed();
            (layer, None)
        }
        LogTarget::File { directory, file_name } => {
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(level)
                .boxed();
            (layer, Some(guard))
        }
    };

    let stdout_layer = if !config.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(level),
        )
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .try_init();

    LoggingGuard(guard)
}
