//! Tracing subscriber setup for the binary.
//!
//! Console output goes to stderr so that stdout stays free for command
//! output. With a log directory, a copy of every event is also appended to
//! `trajqm.log` there through a non-blocking writer.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const LOG_FILE_NAME: &str = "trajqm.log";

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "trajqm=debug,info" } else { "info" })
    })
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live until
/// the program exits.
pub fn init(
    verbose: bool,
    json: bool,
    log_dir: Option<&Path>,
) -> std::io::Result<Option<WorkerGuard>> {
    let console = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(verbose)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(console)
        .with(file)
        .try_init();

    Ok(guard)
}
