//! Repository installer.
//!
//! Opens or clones the tool's git checkout and compares it with its
//! remote. Everything here shells out to the `git` CLI and blocks, so
//! callers run it through the [`Offloader`](crate::offload::Offloader).

mod checkout;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

pub use checkout::{is_missing_or_empty, is_tool_checkout, read_project_name, repository_name};

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};

/// An on-disk checkout of the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Installation {
    /// Root of the checkout.
    pub root: PathBuf,
    /// URL of the `origin` remote.
    pub remote_url: String,
    /// Checked-out branch.
    pub branch: String,
    /// Commit id of `HEAD`.
    pub revision: String,
    /// Local commits not on the remote branch, as of the last check.
    pub ahead: u32,
    /// Remote commits not in `HEAD`, as of the last check.
    pub behind: u32,
}

impl Installation {
    /// Returns true if the last check found newer remote commits.
    #[must_use]
    pub fn update_available(&self) -> bool {
        self.behind > 0
    }
}

/// Opens, clones and updates checkouts through the git CLI.
pub struct RepositoryInstaller {
    runner: Arc<dyn CommandRunner>,
    project_name: String,
    repository_url: String,
}

impl RepositoryInstaller {
    /// Creates an installer recognizing checkouts of `project_name`.
    ///
    /// `repository_url` names the sub-directory `locate` probes.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        project_name: impl Into<String>,
        repository_url: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            project_name: project_name.into(),
            repository_url: repository_url.into(),
        }
    }

    /// Returns the project name valid checkouts declare.
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Finds the checkout at `dir` or in its repository-named child.
    #[must_use]
    pub fn locate(&self, dir: &Path) -> Option<PathBuf> {
        self.locate_for(dir, &self.repository_url)
    }

    fn locate_for(&self, dir: &Path, url: &str) -> Option<PathBuf> {
        if is_tool_checkout(dir, &self.project_name) {
            return Some(dir.to_path_buf());
        }

        let child = dir.join(repository_name(url));
        if is_tool_checkout(&child, &self.project_name) {
            return Some(child);
        }

        None
    }

    /// Opens the existing checkout at `path`.
    ///
    /// # Errors
    /// `NotFound` if there is no valid checkout, `Git` if it cannot be read.
    pub fn open(&self, path: &Path) -> Result<Installation> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let Some(root) = self.locate(path) else {
            return Err(Error::NotFound(format!(
                "{} is not a {} checkout",
                path.display(),
                self.project_name
            )));
        };

        self.describe(&root)
    }

    /// Clones `url` at `branch` into `path`.
    ///
    /// Clones into `path` itself when it is missing or empty, otherwise into
    /// `path/<repository name>`. An existing checkout is opened instead.
    ///
    /// # Errors
    /// `Git` if the clone fails or `branch` is empty, `NotFound` if the
    /// result is not the tool.
    pub fn clone(&self, url: &str, branch: &str, path: &Path) -> Result<Installation> {
        if branch.is_empty() {
            return Err(Error::Git("cannot clone without a branch".to_string()));
        }

        if let Some(existing) = self.locate_for(path, url) {
            info!(
                "[INSTALLER] Reusing existing checkout at {}",
                existing.display()
            );
            return self.describe(&existing);
        }

        let target = if is_missing_or_empty(path) {
            path.to_path_buf()
        } else {
            path.join(repository_name(url))
        };

        if !is_missing_or_empty(&target) {
            return Err(Error::Git(format!(
                "{} already exists and is not a {} checkout",
                target.display(),
                self.project_name
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        info!(
            "[INSTALLER] Cloning {} ({}) into {}",
            url,
            branch,
            target.display()
        );
        let spec = CommandSpec::new("git")
            .args(["clone", "--depth", "1", "--branch", branch])
            .args(["--recurse-submodules", "--shallow-submodules"])
            .arg(url)
            .arg(target.as_os_str());
        self.git_checked(&spec)?;

        self.open(&target)
    }

    /// Initializes and updates submodules recursively.
    ///
    /// # Errors
    /// `Git` if the submodule update fails.
    pub fn init_submodules(&self, installation: &Installation) -> Result<()> {
        debug!(
            "[INSTALLER] Initializing submodules in {}",
            installation.root.display()
        );
        let spec = CommandSpec::new("git")
            .args(["submodule", "update", "--init", "--recursive"])
            .current_dir(&installation.root);
        self.git_checked(&spec)
    }

    /// Fetches the remote and returns `(ahead, behind)` counts.
    ///
    /// Does not touch the working tree.
    ///
    /// # Errors
    /// `Git` if the fetch or comparison fails.
    pub fn check_update(&self, installation: &Installation) -> Result<(u32, u32)> {
        self.fetch(installation)?;

        let range = format!("HEAD...origin/{}", installation.branch);
        let spec = CommandSpec::new("git")
            .args(["rev-list", "--left-right", "--count"])
            .arg(range)
            .current_dir(&installation.root);
        let counts = self.git_stdout(&spec)?;

        let mut parts = counts.split_whitespace().map(str::parse::<u32>);
        match (parts.next(), parts.next()) {
            (Some(Ok(ahead)), Some(Ok(behind))) => {
                debug!("[INSTALLER] ahead={} behind={}", ahead, behind);
                Ok((ahead, behind))
            }
            _ => Err(Error::Git(format!(
                "unexpected rev-list output '{}'",
                counts.trim()
            ))),
        }
    }

    /// Brings the checkout up to the remote tip.
    ///
    /// Without `force`, only a fast-forward is allowed and local changes are
    /// kept; a refused merge returns `Ok(false)` and leaves `HEAD` alone.
    /// With `force`, the checkout is hard-reset to the remote tip.
    ///
    /// # Errors
    /// `Git` if the fetch or reset fails.
    pub fn pull(&self, installation: &Installation, force: bool) -> Result<bool> {
        self.fetch(installation)?;

        let remote_ref = format!("origin/{}", installation.branch);
        let root = &installation.root;

        if force {
            info!("[INSTALLER] Hard reset of {} to {}", root.display(), remote_ref);
            let reset = CommandSpec::new("git")
                .args(["reset", "--hard"])
                .arg(&remote_ref)
                .current_dir(root);
            self.git_checked(&reset)?;
        } else {
            let merge = CommandSpec::new("git")
                .args(["merge", "--ff-only"])
                .arg(&remote_ref)
                .current_dir(root);
            let code = self.git_status(&merge)?;
            if code != Some(0) {
                warn!(
                    "[INSTALLER] Fast-forward to {} refused (exit {:?}); keeping current revision",
                    remote_ref, code
                );
                return Ok(false);
            }
        }

        self.init_submodules(installation)?;
        Ok(true)
    }

    fn fetch(&self, installation: &Installation) -> Result<()> {
        let spec = CommandSpec::new("git")
            .args(["fetch", "origin"])
            .arg(&installation.branch)
            .current_dir(&installation.root);
        self.git_checked(&spec)
    }

    /// Reads remote, branch and revision of the checkout at `root`.
    fn describe(&self, root: &Path) -> Result<Installation> {
        let revision = self.git_stdout(
            &CommandSpec::new("git")
                .args(["rev-parse", "HEAD"])
                .current_dir(root),
        )?;
        let branch = self.git_stdout(
            &CommandSpec::new("git")
                .args(["rev-parse", "--abbrev-ref", "HEAD"])
                .current_dir(root),
        )?;
        // A checkout without an origin is still usable; it just never updates.
        let remote_url = self
            .runner
            .output(
                &CommandSpec::new("git")
                    .args(["config", "--get", "remote.origin.url"])
                    .current_dir(root),
            )
            .ok()
            .filter(|o| o.success())
            .map(|o| o.stdout.trim().to_string())
            .unwrap_or_default();

        let installation = Installation {
            root: root.to_path_buf(),
            remote_url,
            branch: branch.trim().to_string(),
            revision: revision.trim().to_string(),
            ahead: 0,
            behind: 0,
        };
        debug!(
            "[INSTALLER] Opened {} at {} ({})",
            installation.root.display(),
            installation.revision,
            installation.branch
        );
        Ok(installation)
    }

    fn git_status(&self, spec: &CommandSpec) -> Result<Option<i32>> {
        self.runner
            .run(spec)
            .map_err(|e| Error::Git(format!("failed to run '{}': {}", spec, e)))
    }

    fn git_checked(&self, spec: &CommandSpec) -> Result<()> {
        match self.git_status(spec)? {
            Some(0) => Ok(()),
            code => Err(Error::Git(format!(
                "'{}' exited with code {}",
                spec,
                code.map_or_else(|| "none".to_string(), |c| c.to_string())
            ))),
        }
    }

    fn git_stdout(&self, spec: &CommandSpec) -> Result<String> {
        let output = self
            .runner
            .output(spec)
            .map_err(|e| Error::Git(format!("failed to run '{}': {}", spec, e)))?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Git(format!(
                "'{}' failed: {}",
                spec,
                output.stderr.trim()
            )))
        }
    }
}

impl std::fmt::Debug for RepositoryInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryInstaller")
            .field("project_name", &self.project_name)
            .field("repository_url", &self.repository_url)
            .finish_non_exhaustive()
    }
}
