//! Logging setup for toolwarden.
//!
//! Logs go to timestamped files under ~/.toolwarden/logs/ and, for the
//! CLI, optionally to stderr. Old files are removed at init according to
//! the configured retention.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 24;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Target used for lines printed by the supervised tool.
pub const TOOL_TARGET: &str = "toolwarden::tool";

/// Target used for output of provisioning commands (git, venv, pip).
pub const COMMAND_TARGET: &str = "toolwarden::command";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log retention period in hours.
    pub retention_hours: u32,
    /// Log level (trace, debug, info, warn, error, off).
    pub level: String,
    /// Whether file logging is enabled.
    pub enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            level: DEFAULT_LOG_LEVEL.to_string(),
            enabled: true,
        }
    }
}

impl LogConfig {
    /// Parses log level from string.
    #[must_use]
    pub fn parse_level(value: &str) -> String {
        match value.to_lowercase().as_str() {
            "trace" => "trace".to_string(),
            "debug" => "debug".to_string(),
            "info" => "info".to_string(),
            "warn" | "warning" => "warn".to_string(),
            "error" => "error".to_string(),
            "off" | "none" | "disabled" => "off".to_string(),
            _ => DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Parses retention hours from string.
    #[must_use]
    pub fn parse_retention(value: &str) -> u32 {
        value.parse().unwrap_or(DEFAULT_LOG_RETENTION_HOURS)
    }
}

/// Returns the log directory path (~/.toolwarden/logs/).
#[must_use]
pub fn log_directory() -> PathBuf {
    crate::config::warden_home().join("logs")
}

/// Returns a fresh log file name for the current time.
#[must_use]
pub fn log_file_name() -> String {
    let now = chrono::Local::now();
    format!("toolwarden_{}.log", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Deletes `.log` files in `dir` older than the retention period.
///
/// # Errors
/// Returns error if the directory cannot be read.
pub fn cleanup_old_logs(dir: &Path, retention_hours: u32) -> io::Result<u32> {
    if !dir.exists() {
        return Ok(0);
    }

    let retention = Duration::from_secs(u64::from(retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());

        if let Some(age) = age {
            if age > retention && fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}

/// Initializes the global subscriber.
///
/// Returns the appender guard when file logging is active; it must be kept
/// alive for the lifetime of the program or buffered lines are lost.
/// `RUST_LOG` overrides the configured level.
///
/// # Errors
/// Returns error if the log directory or file cannot be created.
pub fn init(config: &LogConfig, stderr: bool) -> io::Result<Option<WorkerGuard>> {
    let file_logging = config.enabled && config.level != "off";
    if !file_logging && !stderr {
        return Ok(None);
    }

    let level = if config.level == "off" {
        DEFAULT_LOG_LEVEL
    } else {
        config.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = stderr.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .compact()
    });

    let mut deleted = 0;
    let mut log_path = None;
    let (file_layer, guard) = if file_logging {
        let dir = log_directory();
        fs::create_dir_all(&dir)?;
        deleted = cleanup_old_logs(&dir, config.retention_hours)?;

        let name = log_file_name();
        let appender = tracing_appender::rolling::never(&dir, &name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        log_path = Some(dir.join(name));

        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .with_line_number(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    tracing::info!("[LOGGING] toolwarden logging initialized");
    if let Some(path) = log_path {
        tracing::info!("[LOGGING] Log file: {}", path.display());
        tracing::info!("[LOGGING] Log retention: {} hours", config.retention_hours);
    }
    if deleted > 0 {
        tracing::info!("[LOGGING] Cleaned up {} old log file(s)", deleted);
    }

    Ok(guard)
}
