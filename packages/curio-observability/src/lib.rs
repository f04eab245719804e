//! # Curio observability
//!
//! Logging setup for the Curio SDK delivery core.
//!
//! Library crates only *produce* logs through `tracing` macros. The host
//! binary calls [`init_with_config`] once at startup, which installs:
//!
//! - a JSON-lines layer appending to `~/.curio/logs/curio.jsonl`
//! - an optional compact stderr layer for foreground runs
//! - an `EnvFilter` taken from `RUST_LOG`, falling back to the configured level
//!
//! ```rust,ignore
//! curio_observability::init_with_config(curio_observability::LogConfig {
//!     service_name: "curio-sample".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! tracing::info!("ready");
//! ```
//!
//! Request parameters that reach the logs go through [`redact_params`] so
//! api keys and push tokens never land in the JSONL file.

mod json_layer;
mod redact;
mod writer;

use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use json_layer::{JsonLayer, LogEntry};
pub use redact::{is_sensitive_key, redact_params, REDACTED};
pub use writer::{LogFileWriter, WriterFactory};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every log line.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional custom log file path.
    /// Defaults to `~/.curio/logs/curio.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Also emit logs to stderr for immediate feedback.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "curio".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Default JSONL log location.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".curio").join("logs").join("curio.jsonl"))
}

/// Initialize logging with default settings for the given service.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// If the log file cannot be opened, logging falls back to stderr only and
/// the failure is reported once through that layer.
pub fn init_with_config(config: LogConfig) {
    let log_path = config.log_path.clone().or_else(default_log_path);

    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level))
    };

    let mut open_error = None;
    let json_layer = match log_path.as_ref().map(LogFileWriter::new) {
        Some(Ok(writer)) => Some(
            JsonLayer::new(config.service_name.clone(), WriterFactory::new(writer))
                .with_filter(env_filter()),
        ),
        Some(Err(e)) => {
            open_error = Some(e.to_string());
            None
        }
        None => None,
    };

    let stderr_enabled = config.also_stderr || json_layer.is_none();
    let stderr_layer = stderr_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(env_filter())
    });

    let installed = tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if !installed {
        return;
    }

    match (log_path, open_error) {
        (Some(path), None) => {
            tracing::info!(log_path = %path.display(), service = %config.service_name, "logging initialized");
        }
        (path, Some(error)) => {
            tracing::warn!(
                log_path = ?path,
                error = %error,
                "could not open log file, logging to stderr only"
            );
        }
        (None, None) => {
            tracing::warn!("no home directory, logging to stderr only");
        }
    }
}

pub use tracing::{debug, error, info, trace, warn, Level};
