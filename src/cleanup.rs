//! Installation removal with permission recovery.
//!
//! Checkouts often contain read-only files (git packs on Windows, files
//! copied from read-only media). A removal that hits a permission error
//! makes the remaining tree writable and tries again, a bounded number of
//! times.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Outcome of a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalReport {
    /// True if the path no longer exists.
    pub removed: bool,
    /// Number of removal attempts made (0 if the path never existed).
    pub attempts: u32,
}

/// Recursively removes directories.
#[derive(Debug, Clone, Copy)]
pub struct CleanupManager {
    max_attempts: u32,
    backoff: Duration,
}

impl CleanupManager {
    /// Creates a manager that tries up to `max_attempts` times.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        assert!(max_attempts > 0, "max_attempts must be at least 1");
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Removes `path` and returns true if it no longer exists.
    #[must_use]
    pub fn remove(&self, path: &Path) -> bool {
        self.remove_with_report(path).removed
    }

    /// Removes `path` and reports how many attempts it took.
    pub fn remove_with_report(&self, path: &Path) -> RemovalReport {
        if fs::symlink_metadata(path).is_err() {
            debug!("[CLEANUP] Nothing to remove at {}", path.display());
            return RemovalReport {
                removed: true,
                attempts: 0,
            };
        }

        let mut attempts = 0;
        while attempts < self.max_attempts {
            attempts += 1;

            match remove_path(path) {
                Ok(()) => {
                    info!(
                        "[CLEANUP] Removed {} after {} attempt(s)",
                        path.display(),
                        attempts
                    );
                    return RemovalReport {
                        removed: true,
                        attempts,
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return RemovalReport {
                        removed: true,
                        attempts,
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(
                        "[CLEANUP] Permission denied removing {} (attempt {}/{}): {}",
                        path.display(),
                        attempts,
                        self.max_attempts,
                        e
                    );
                    make_writable(path);
                }
                Err(e) => {
                    warn!(
                        "[CLEANUP] Failed to remove {} (attempt {}/{}): {}",
                        path.display(),
                        attempts,
                        self.max_attempts,
                        e
                    );
                }
            }

            if attempts < self.max_attempts && !self.backoff.is_zero() {
                thread::sleep(self.backoff);
            }
        }

        let removed = fs::symlink_metadata(path).is_err();
        if !removed {
            warn!(
                "[CLEANUP] Giving up on {} after {} attempts",
                path.display(),
                attempts
            );
        }
        RemovalReport { removed, attempts }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Clears read-only bits on `path` and everything below it.
fn make_writable(path: &Path) {
    for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.file_type().is_symlink() {
            continue;
        }

        let mut permissions = metadata.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let extra = if metadata.is_dir() { 0o700 } else { 0o600 };
            permissions.set_mode(permissions.mode() | extra);
        }
        #[cfg(not(unix))]
        {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
        }

        if let Err(e) = fs::set_permissions(entry.path(), permissions) {
            debug!(
                "[CLEANUP] Could not relax permissions on {}: {}",
                entry.path().display(),
                e
            );
        }
    }
}
