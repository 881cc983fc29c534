//! Structured logging configuration.
//!
//! - JSON output for production (`LOG_FORMAT=json`)
//! - Human-readable output for local development (default)
//! - An optional additive file sink when `MIRROR_LOG_FILE` is set, so an
//!   operator always has the process log on stdout even when file logging
//!   is also enabled.
//!
//! `RUST_LOG` is the standard tracing filter (default: `info`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Guard returned by `init_logging`; must be kept alive for the life of the
/// process or the file sink's background flush thread is torn down early.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initializes logging for `service_name`. Reads `LOG_FORMAT` (`json` or
/// text, default text) and `RUST_LOG` (default `info`), and additionally
/// tees output to the path in `MIRROR_LOG_FILE` if set.
pub fn init_logging(service_name: &str) -> LoggingGuard {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = log_format.eq_ignore_ascii_case("json");

    let file_layer_guard = std::env::var("MIRROR_LOG_FILE")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .and_then(|path| build_file_writer(Path::new(path.trim())));

    let stdout_layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(false)
            .with_target(true)
            .flatten_event(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true)
            .boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match file_layer_guard {
        Some((writer, guard)) => {
            let file_layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            registry.with(file_layer).init();
            tracing::info!(service = service_name, "logging initialized with file sink");
            LoggingGuard { _file_guard: Some(guard) }
        }
        None => {
            registry.init();
            tracing::info!(service = service_name, "logging initialized");
            LoggingGuard { _file_guard: None }
        }
    }
}

fn build_file_writer(path: &Path) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name()?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_parses_with_fallback() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        drop(filter);
    }
}
