//! Persisted per-context state.
//!
//! Remembers, for each instance context, where its installation lives and
//! which port the tool last bound to. Stored in `~/.toolwarden/state.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum size accepted for the state file (256KB).
const MAX_FILE_SIZE: u64 = 256 * 1024;

/// State storage errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// File too large.
    #[error("State file too large (max {MAX_FILE_SIZE} bytes)")]
    FileTooLarge,
}

impl From<StateError> for crate::Error {
    fn from(err: StateError) -> Self {
        crate::Error::Config(err.to_string())
    }
}

/// What is remembered about one context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Directory the installation was opened from or cloned into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_directory: Option<PathBuf>,
    /// Port the tool actually bound to, when it differed from the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    instances: BTreeMap<String, InstanceRecord>,
}

/// Reads and writes the state file.
///
/// Clones share one lock so concurrent instances never interleave writes.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        assert!(!path.as_os_str().is_empty(), "path must not be empty");

        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the default state path (~/.toolwarden/state.toml).
    #[must_use]
    pub fn default_path() -> PathBuf {
        super::warden_home().join("state.toml")
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the record for `context`, or an empty one.
    pub fn get(&self, context: &str) -> Result<InstanceRecord, StateError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let file = self.read()?;
        Ok(file.instances.get(context).cloned().unwrap_or_default())
    }

    /// Applies `change` to the record for `context` and saves the file.
    pub fn update<F>(&self, context: &str, change: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = self.read()?;

        let record = file.instances.entry(context.to_string()).or_default();
        change(record);
        if *record == InstanceRecord::default() {
            file.instances.remove(context);
        }

        self.write(&file)
    }

    /// Remembers (or forgets) the installation directory of `context`.
    pub fn set_install_directory(
        &self,
        context: &str,
        directory: Option<&Path>,
    ) -> Result<(), StateError> {
        let directory = directory.map(Path::to_path_buf);
        self.update(context, move |record| record.install_directory = directory)
    }

    /// Remembers (or forgets) the bound port of `context`.
    pub fn set_port(&self, context: &str, port: Option<u16>) -> Result<(), StateError> {
        self.update(context, move |record| record.port = port)
    }

    fn read(&self) -> Result<StateFile, StateError> {
        if !self.path.exists() {
            return Ok(StateFile::default());
        }

        let metadata = fs::metadata(&self.path)?;
        if metadata.len() > MAX_FILE_SIZE {
            return Err(StateError::FileTooLarge);
        }

        let content = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    fn write(&self, file: &StateFile) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(file)?;

        // Write atomically (write to temp, then rename)
        let temp_path = self.path.with_extension("tmp");
        {
            let mut out = fs::File::create(&temp_path)?;
            out.write_all(content.as_bytes())?;
            out.flush()?;
        }
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}
