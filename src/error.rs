//! Error taxonomy for toolwarden.
//!
//! Every failure a lifecycle command can surface maps onto one variant
//! here. The `Display` text doubles as the message carried by
//! [`LifecycleState::Error`](crate::lifecycle::LifecycleState::Error).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the installer, provisioner, fetcher and supervisor.
#[derive(Debug, Error)]
pub enum Error {
    /// No valid installation at the given path.
    #[error("No valid installation found: {0}")]
    NotFound(String),

    /// A lifecycle command needs an installation and none is open.
    #[error("No installation is open for this instance")]
    NotInstalled,

    /// Clone, pull or remote check failed.
    #[error("Git error: {0}")]
    Git(String),

    /// The runtime environment could not be created.
    #[error("Environment provisioning failed: {0}")]
    Provisioning(String),

    /// Package installation failed.
    #[error("Dependency installation failed: {0}")]
    Dependency(String),

    /// The model manifest is missing or malformed.
    #[error("Model manifest error: {0}")]
    Manifest(String),

    /// An asset download failed.
    #[error("Download failed: {0}")]
    Download(String),

    /// The tool process is live and the command requires it stopped.
    #[error("The tool is already running (pid {pid})")]
    AlreadyRunning {
        /// Process identifier of the live process.
        pid: u32,
    },

    /// The tool exited before its readiness endpoint answered.
    #[error("The tool exited before becoming ready (exit code {})", display_code(.code))]
    Startup {
        /// Exit code, if the platform reported one.
        code: Option<i32>,
    },

    /// The readiness endpoint did not answer in time.
    #[error("The tool did not become ready within {seconds:.1}s")]
    Timeout {
        /// Configured startup timeout in seconds.
        seconds: f64,
    },

    /// A permission problem that survived every cleanup retry.
    #[error("Permission error: {0}")]
    Permission(String),

    /// The operation was abandoned by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration could not be read or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The blocking worker pool failed to run a task.
    #[error("Background worker failed: {0}")]
    Offload(String),

    /// The instance actor is gone.
    #[error("Instance '{0}' has shut down")]
    Closed(String),

    /// Plain I/O failure.
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Fieldless discriminant of [`Error`], handy for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NotInstalled,
    Git,
    Provisioning,
    Dependency,
    Manifest,
    Download,
    AlreadyRunning,
    Startup,
    Timeout,
    Permission,
    Cancelled,
    Config,
    Offload,
    Closed,
    Io,
}

impl Error {
    /// Wraps an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the discriminant of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotInstalled => ErrorKind::NotInstalled,
            Self::Git(_) => ErrorKind::Git,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::Dependency(_) => ErrorKind::Dependency,
            Self::Manifest(_) => ErrorKind::Manifest,
            Self::Download(_) => ErrorKind::Download,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::Startup { .. } => ErrorKind::Startup,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Offload(_) => ErrorKind::Offload,
            Self::Closed(_) => ErrorKind::Closed,
            Self::Io { .. } => ErrorKind::Io,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_message_carries_code() {
        let err = Error::Startup { code: Some(3) };
        assert_eq!(
            err.to_string(),
            "The tool exited before becoming ready (exit code 3)"
        );

        let err = Error::Startup { code: None };
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout { seconds: 2.0 };
        assert_eq!(err.to_string(), "The tool did not become ready within 2.0s");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_io_helper_keeps_path() {
        let err = Error::io("/tmp/x", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("/tmp/x"));
    }
}
