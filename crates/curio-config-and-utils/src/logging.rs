//! Logging initialization.
//!
//! Thin wrapper over `curio-observability`: structured JSONL goes to
//! `~/.curio/logs/curio.jsonl`, level from `RUST_LOG` or the given default.

use crate::Paths;

/// Initialize logging for a host binary.
///
/// ```ignore
/// init_logging("info", None);
/// tracing::info!("sample host started");
/// ```
pub fn init_logging(level: &str, paths: Option<&Paths>) {
    init_logging_for_service("curio", level, paths);
}

/// Initialize logging with a custom service name.
pub fn init_logging_for_service(service_name: &str, level: &str, paths: Option<&Paths>) {
    curio_observability::init_with_config(curio_observability::LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        log_path: paths.map(Paths::log_file),
        also_stderr: true,
    });
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
