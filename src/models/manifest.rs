//! Model manifest parsing.
//!
//! ```toml
//! [[huggingface]]
//! repo_id = "org/name"
//! filename = "sub/file.safetensors"
//! revision = "main"
//! local_dir = "models/checkpoints"
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const REQUIRED_KEYS: [&str; 4] = ["repo_id", "filename", "revision", "local_dir"];

/// One required model asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelManifestEntry {
    /// Repository holding the asset.
    pub repo_id: String,
    /// Path of the asset inside the repository.
    pub filename: String,
    /// Branch, tag or commit to download from.
    pub revision: String,
    /// Destination directory, relative to the installation.
    pub local_dir: String,
}

impl ModelManifestEntry {
    /// Returns the final file name of the asset.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.filename)
    }

    /// Returns where the asset lands inside `install_root`.
    #[must_use]
    pub fn destination(&self, install_root: &Path) -> PathBuf {
        install_root.join(&self.local_dir).join(self.file_name())
    }
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    huggingface: Vec<toml::Table>,
}

/// Loads and validates every entry of the manifest at `path`.
///
/// # Errors
/// `Manifest` naming the first invalid entry, or if the file is unreadable.
pub fn load_manifest(path: &Path) -> Result<Vec<ModelManifestEntry>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Manifest(format!("cannot read {}: {}", path.display(), e)))?;
    parse_manifest(&content)
}

/// Parses manifest text.
///
/// # Errors
/// `Manifest` naming the first invalid entry.
pub fn parse_manifest(content: &str) -> Result<Vec<ModelManifestEntry>> {
    let raw: RawManifest =
        toml::from_str(content).map_err(|e| Error::Manifest(format!("invalid TOML: {}", e)))?;

    raw.huggingface
        .iter()
        .enumerate()
        .map(|(index, table)| parse_entry(index + 1, table))
        .collect()
}

fn parse_entry(number: usize, table: &toml::Table) -> Result<ModelManifestEntry> {
    let label = table
        .get("repo_id")
        .and_then(|v| v.as_str())
        .map_or_else(|| format!("entry {}", number), |id| format!("entry {} ({})", number, id));

    let mut values = Vec::with_capacity(REQUIRED_KEYS.len());
    for key in REQUIRED_KEYS {
        match table.get(key).and_then(|v| v.as_str()) {
            Some(value) if !value.trim().is_empty() => values.push(value.trim().to_string()),
            Some(_) => {
                return Err(Error::Manifest(format!("{} has an empty '{}'", label, key)));
            }
            None => {
                return Err(Error::Manifest(format!(
                    "{} is missing required key '{}'",
                    label, key
                )));
            }
        }
    }

    let [repo_id, filename, revision, local_dir] = <[String; 4]>::try_from(values)
        .map_err(|_| Error::Manifest(format!("{} is incomplete", label)))?;

    for (key, value) in [("filename", &filename), ("local_dir", &local_dir)] {
        if !is_relative_inside(Path::new(value)) {
            return Err(Error::Manifest(format!(
                "{} has '{}' escaping its directory: {}",
                label, key, value
            )));
        }
    }

    Ok(ModelManifestEntry {
        repo_id,
        filename,
        revision,
        local_dir,
    })
}

fn is_relative_inside(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
