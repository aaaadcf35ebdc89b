//! Runtime environment provisioning.
//!
//! Each installation gets its own virtual environment inside the checkout.
//! Requirements of the tool and of every plugin are installed with a single
//! pip invocation so the resolver sees all constraints at once.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::{Config, platform};
use crate::error::{Error, Result};
use crate::installer::Installation;

/// Name of the requirement file looked up in the checkout and plugins.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// An isolated interpreter environment for one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEnvironment {
    /// Root of the virtual environment.
    pub root: PathBuf,
    /// Interpreter inside the environment.
    pub interpreter: PathBuf,
    /// True once the interpreter is known to exist.
    pub ready: bool,
}

/// Creates environments and installs packages into them.
pub struct EnvironmentProvisioner {
    runner: Arc<dyn CommandRunner>,
    base_interpreter: String,
    venv_directory: String,
    backend_packages: Vec<String>,
    plugin_directory: String,
}

impl EnvironmentProvisioner {
    /// Creates a provisioner using the environment settings of `config`.
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            base_interpreter: config.base_interpreter.clone(),
            venv_directory: config.venv_directory.clone(),
            backend_packages: config.backend_packages.clone(),
            plugin_directory: config.plugin_directory.clone(),
        }
    }

    /// Returns the environment root for `installation`.
    #[must_use]
    pub fn environment_root(&self, installation: &Installation) -> PathBuf {
        installation.root.join(&self.venv_directory)
    }

    /// Creates the environment, or returns the existing one unchanged.
    ///
    /// # Errors
    /// `Provisioning` if the environment cannot be created.
    pub fn create(&self, installation: &Installation) -> Result<RuntimeEnvironment> {
        let root = self.environment_root(installation);
        let interpreter = platform::venv_interpreter(&root);

        if interpreter.exists() {
            debug!("[ENVIRONMENT] Reusing {}", root.display());
            return Ok(RuntimeEnvironment {
                root,
                interpreter,
                ready: true,
            });
        }

        info!("[ENVIRONMENT] Creating environment at {}", root.display());
        let spec = CommandSpec::new(&self.base_interpreter)
            .args(["-s", "-m", "venv"])
            .arg(root.as_os_str())
            .current_dir(&installation.root);

        let code = self.runner.run(&spec).map_err(|e| {
            Error::Provisioning(format!(
                "could not run '{}': {}",
                self.base_interpreter, e
            ))
        })?;
        if code != Some(0) {
            return Err(Error::Provisioning(format!(
                "'{}' exited with code {:?}",
                spec, code
            )));
        }
        if !interpreter.exists() {
            return Err(Error::Provisioning(format!(
                "no interpreter at {} after creating the environment",
                interpreter.display()
            )));
        }

        Ok(RuntimeEnvironment {
            root,
            interpreter,
            ready: true,
        })
    }

    /// Lists the tool's requirement file and those of its plugins.
    ///
    /// Plugin files are returned in directory-name order.
    #[must_use]
    pub fn discover_requirement_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();

        let main = root.join(REQUIREMENTS_FILE);
        if main.is_file() {
            files.push(main);
        }

        let plugins = root.join(&self.plugin_directory);
        let mut plugin_files: Vec<PathBuf> = fs::read_dir(&plugins)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .map(|path| path.join(REQUIREMENTS_FILE))
            .filter(|path| path.is_file())
            .collect();
        plugin_files.sort();
        files.extend(plugin_files);

        files
    }

    /// Installs backend packages and every requirement file in one pip run.
    ///
    /// # Errors
    /// `Dependency` if pip cannot be run or fails.
    pub fn install_dependencies(
        &self,
        env: &RuntimeEnvironment,
        extra_index: Option<&str>,
        requirement_files: &[PathBuf],
    ) -> Result<()> {
        if self.backend_packages.is_empty() && requirement_files.is_empty() {
            debug!("[ENVIRONMENT] Nothing to install");
            return Ok(());
        }

        let mut spec = CommandSpec::new(env.interpreter.as_os_str())
            .args(["-s", "-m", "pip", "install", "--upgrade"])
            .args(self.backend_packages.iter().map(String::as_str));
        if let Some(index) = extra_index {
            spec = spec.args(["--extra-index-url", index]);
        }
        for file in requirement_files {
            spec = spec.arg("-r").arg(file.as_os_str());
        }
        if let Some(parent) = env.root.parent() {
            spec = spec.current_dir(parent);
        }

        info!(
            "[ENVIRONMENT] Installing {} package(s) and {} requirement file(s)",
            self.backend_packages.len(),
            requirement_files.len()
        );
        let code = self
            .runner
            .run(&spec)
            .map_err(|e| Error::Dependency(format!("could not run pip: {}", e)))?;
        if code != Some(0) {
            return Err(Error::Dependency(format!(
                "pip exited with code {:?}",
                code
            )));
        }

        Ok(())
    }
}
