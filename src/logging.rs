//! Tracing setup for the pipeline binary.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// File name prefix for the rolling log.
const LOG_FILE: &str = "email-pipeline.log";

/// Install the global subscriber.
///
/// Logs always go to stderr. When `log_dir` is set, a daily-rolling file
/// without ANSI colors is written there as well; the returned guard must be
/// held until shutdown so buffered lines get flushed. `RUST_LOG` overrides
/// the default `info` level.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = None;
    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: cannot create log directory {}: {e}", dir.display());
            return None;
        }
        let (writer, file_guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE));
        guard = Some(file_guard);
        Some(fmt::layer().with_ansi(false).with_writer(writer))
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("Warning: tracing already initialized: {e}");
    }
    guard
}
