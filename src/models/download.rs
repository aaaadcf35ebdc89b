//! Asset downloads.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use super::ModelManifestEntry;
use crate::error::{Error, Result};

/// Puts a complete copy of an asset into the cache.
pub trait AssetDownloader: Send + Sync {
    /// Downloads `entry` into `cache_dir` and returns the cached file.
    ///
    /// # Errors
    /// `Download` if the asset cannot be fetched.
    fn download(&self, entry: &ModelManifestEntry, cache_dir: &Path) -> Result<PathBuf>;
}

/// Downloads assets from a Hugging Face compatible host.
#[derive(Debug, Clone)]
pub struct HuggingFaceDownloader {
    endpoint: String,
    token: Option<String>,
}

impl HuggingFaceDownloader {
    /// Creates a downloader for `endpoint` with an optional bearer token.
    ///
    /// # Errors
    /// `Config` if `endpoint` is empty.
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(Error::Config("model endpoint must not be empty".to_string()));
        }
        Ok(Self { endpoint, token })
    }

    /// Creates a downloader reading its token from `HF_TOKEN`.
    ///
    /// # Errors
    /// `Config` if `endpoint` is empty.
    pub fn from_env(endpoint: impl Into<String>) -> Result<Self> {
        let token = std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
        Self::new(endpoint, token)
    }

    /// Returns the URL `entry` is fetched from.
    #[must_use]
    pub fn url_for(&self, entry: &ModelManifestEntry) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, entry.repo_id, entry.revision, entry.filename
        )
    }
}

impl AssetDownloader for HuggingFaceDownloader {
    fn download(&self, entry: &ModelManifestEntry, cache_dir: &Path) -> Result<PathBuf> {
        let cached = cache_dir.join(&entry.filename);
        if cached.is_file() {
            debug!("[MODELS] Reusing cached {}", cached.display());
            return Ok(cached);
        }

        let partial = partial_path(&cached);
        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let url = self.url_for(entry);
        info!("[MODELS] Downloading {}", url);

        // Large files: no overall deadline, only a connect timeout.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| Error::Download(format!("http client: {}", e)))?;

        let mut request = client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .map_err(|e| Error::Download(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let mut file = fs::File::create(&partial).map_err(|e| Error::io(&partial, e))?;
        let bytes = response
            .copy_to(&mut file)
            .map_err(|e| Error::Download(format!("{}: {}", url, e)))?;
        file.flush().map_err(|e| Error::io(&partial, e))?;
        drop(file);

        fs::rename(&partial, &cached).map_err(|e| Error::io(&cached, e))?;
        info!("[MODELS] Cached {} ({} bytes)", cached.display(), bytes);
        Ok(cached)
    }
}

/// Returns `<path>.part`.
#[must_use]
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
