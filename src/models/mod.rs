//! Model asset fetching.
//!
//! Assets listed in the manifest are downloaded into a shared cache and then
//! moved into the installation. An asset whose destination already exists is
//! skipped, so an interrupted pass can simply be run again.

mod download;
mod manifest;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

pub use download::{AssetDownloader, HuggingFaceDownloader, partial_path};
pub use manifest::{ModelManifestEntry, load_manifest, parse_manifest};

use crate::error::{Error, Result};

/// What a fetch pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    /// Destinations that were downloaded in this pass.
    pub downloaded: Vec<PathBuf>,
    /// Destinations that already existed.
    pub skipped: Vec<PathBuf>,
}

/// Brings every manifest asset into an installation.
#[derive(Clone)]
pub struct ModelAssetFetcher {
    downloader: Arc<dyn AssetDownloader>,
}

impl ModelAssetFetcher {
    /// Creates a fetcher using `downloader`.
    pub fn new(downloader: Arc<dyn AssetDownloader>) -> Self {
        Self { downloader }
    }

    /// Fetches the assets of `manifest_path` into `install_root`.
    ///
    /// The manifest is validated completely before anything is downloaded.
    ///
    /// # Errors
    /// `Manifest` for an invalid manifest, `Download` or `Io` for transfer
    /// and relocation failures.
    pub fn fetch(
        &self,
        manifest_path: &Path,
        cache_dir: &Path,
        install_root: &Path,
    ) -> Result<FetchReport> {
        let entries = load_manifest(manifest_path)?;
        info!(
            "[MODELS] {} asset(s) listed in {}",
            entries.len(),
            manifest_path.display()
        );

        let mut report = FetchReport::default();
        for entry in &entries {
            let destination = entry.destination(install_root);
            if destination.exists() {
                debug!("[MODELS] Already present: {}", destination.display());
                report.skipped.push(destination);
                continue;
            }

            let cached = self.downloader.download(entry, cache_dir)?;
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            move_file(&cached, &destination).map_err(|e| Error::io(&destination, e))?;

            info!("[MODELS] Installed {}", destination.display());
            report.downloaded.push(destination);
        }

        Ok(report)
    }
}

/// Moves `from` to `to`, copying when a rename crosses filesystems.
///
/// The copy lands next to `to` first so the destination is never partial.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    let staging = partial_path(to);
    fs::copy(from, &staging)?;
    fs::rename(&staging, to)?;
    fs::remove_file(from)
}

impl std::fmt::Debug for ModelAssetFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelAssetFetcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes the asset name into the cache and counts calls.
    #[derive(Default)]
    struct CountingDownloader {
        calls: AtomicUsize,
    }

    impl AssetDownloader for CountingDownloader {
        fn download(&self, entry: &ModelManifestEntry, cache_dir: &Path) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let cached = cache_dir.join(&entry.filename);
            fs::create_dir_all(cached.parent().unwrap()).unwrap();
            fs::write(&cached, &entry.repo_id).unwrap();
            Ok(cached)
        }
    }

    struct FailingDownloader;

    impl AssetDownloader for FailingDownloader {
        fn download(&self, entry: &ModelManifestEntry, _cache_dir: &Path) -> Result<PathBuf> {
            Err(Error::Download(format!("{} unavailable", entry.repo_id)))
        }
    }

    const MANIFEST: &str = r#"
[[huggingface]]
repo_id = "org/one"
filename = "one.bin"
revision = "main"
local_dir = "models/a"

[[huggingface]]
repo_id = "org/two"
filename = "nested/two.bin"
revision = "main"
local_dir = "models/b"

[[huggingface]]
repo_id = "org/three"
filename = "three.bin"
revision = "v1"
local_dir = "models/a"
"#;

    #[test]
    fn test_existing_destination_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("install");
        let cache = dir.path().join("cache");
        let manifest = dir.path().join("models.toml");
        fs::write(&manifest, MANIFEST).unwrap();

        let existing = install.join("models/b/two.bin");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, "already here").unwrap();

        let downloader = Arc::new(CountingDownloader::default());
        let fetcher = ModelAssetFetcher::new(downloader.clone());
        let report = fetcher.fetch(&manifest, &cache, &install).unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.skipped, vec![existing.clone()]);
        assert_eq!(
            report.downloaded,
            vec![
                install.join("models/a/one.bin"),
                install.join("models/a/three.bin")
            ]
        );
        assert_eq!(fs::read_to_string(&existing).unwrap(), "already here");
        assert!(!cache.join("one.bin").exists());
    }

    #[test]
    fn test_second_pass_downloads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("models.toml");
        fs::write(&manifest, MANIFEST).unwrap();

        let downloader = Arc::new(CountingDownloader::default());
        let fetcher = ModelAssetFetcher::new(downloader.clone());
        fetcher
            .fetch(&manifest, &dir.path().join("cache"), dir.path())
            .unwrap();
        let report = fetcher
            .fetch(&manifest, &dir.path().join("cache"), dir.path())
            .unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 3);
        assert!(report.downloaded.is_empty());
        assert_eq!(report.skipped.len(), 3);
    }

    #[test]
    fn test_invalid_manifest_aborts_before_download() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("models.toml");
        fs::write(
            &manifest,
            format!("{}\n[[huggingface]]\nrepo_id = \"org/bad\"\n", MANIFEST),
        )
        .unwrap();

        let downloader = Arc::new(CountingDownloader::default());
        let fetcher = ModelAssetFetcher::new(downloader.clone());
        let err = fetcher
            .fetch(&manifest, &dir.path().join("cache"), dir.path())
            .unwrap_err();

        assert!(matches!(err, Error::Manifest(_)));
        assert!(err.to_string().contains("entry 4 (org/bad)"));
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_download_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("models.toml");
        fs::write(&manifest, MANIFEST).unwrap();

        let fetcher = ModelAssetFetcher::new(Arc::new(FailingDownloader));
        let err = fetcher
            .fetch(&manifest, &dir.path().join("cache"), dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::Download(_)));
    }

    #[test]
    fn test_missing_manifest_is_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ModelAssetFetcher::new(Arc::new(FailingDownloader));
        let err = fetcher
            .fetch(&dir.path().join("nope.toml"), dir.path(), dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::Manifest(_)));
    }
}
