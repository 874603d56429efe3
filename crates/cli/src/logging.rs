//! Logging for the `podlink` CLI.
//!
//! Events go to a daily rolling file at `<state dir>/podlink/debug.log` and to
//! stderr. Stdout carries only the forwarding announcements.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_DIR_NAME: &str = "podlink";

const LOG_FILE_NAME: &str = "debug.log";

/// Transport internals are only interesting when they go wrong.
const QUIET_TARGETS: &[&str] = &[
    "tokio=warn",
    "quinn=warn",
    "quinn_proto=warn",
    "quinn_udp=warn",
    "rustls=warn",
];

/// Install the global subscriber.
///
/// The returned [`WorkerGuard`] must live until exit; dropping it flushes the
/// log file.
pub fn init_logging(verbose: bool) -> WorkerGuard {
    let log_dir = log_directory();

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warning: could not create log directory {}: {e}",
            log_dir.display()
        );
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false);

    tracing_subscriber::registry()
        .with(build_filter(verbose))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
fn build_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    for directive in QUIET_TARGETS {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("warning: ignoring log directive '{directive}': {e}"),
        }
    }
    filter
}

/// `dirs::state_dir()` on Linux, `~/.local/state` elsewhere, cwd as a last resort.
fn log_directory() -> PathBuf {
    if let Some(state) = dirs::state_dir() {
        return state.join(LOG_DIR_NAME);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("state").join(LOG_DIR_NAME);
    }
    PathBuf::from(".")
}
