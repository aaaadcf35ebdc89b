//! Integration tests for model asset downloads.
//!
//! A local axum server stands in for the model host.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use toolwarden::ErrorKind;
use toolwarden::models::{
    AssetDownloader, HuggingFaceDownloader, ModelAssetFetcher, ModelManifestEntry, partial_path,
};

struct Host {
    hits: AtomicUsize,
    token: Option<String>,
}

impl Host {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn body_for(org: &str, name: &str, revision: &str, file: &str) -> String {
    format!("{}/{}@{}:{}", org, name, revision, file)
}

async fn resolve(
    State(host): State<Arc<Host>>,
    Path((org, name, revision, file)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> (StatusCode, Vec<u8>) {
    host.hits.fetch_add(1, Ordering::SeqCst);

    if let Some(token) = &host.token {
        let expected = format!("Bearer {}", token);
        let given = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, Vec::new());
        }
    }
    if file.starts_with("missing") {
        return (StatusCode::NOT_FOUND, Vec::new());
    }
    (
        StatusCode::OK,
        body_for(&org, &name, &revision, &file).into_bytes(),
    )
}

async fn serve(token: Option<&str>) -> (String, Arc<Host>) {
    let host = Arc::new(Host {
        hits: AtomicUsize::new(0),
        token: token.map(str::to_string),
    });
    let router = Router::new()
        .route("/{org}/{name}/resolve/{revision}/{*file}", get(resolve))
        .with_state(Arc::clone(&host));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", address), host)
}

fn entry(filename: &str, local_dir: &str) -> ModelManifestEntry {
    ModelManifestEntry {
        repo_id: "org/model".to_string(),
        filename: filename.to_string(),
        revision: "main".to_string(),
        local_dir: local_dir.to_string(),
    }
}

/// Runs a blocking download off the runtime threads.
async fn download(
    downloader: HuggingFaceDownloader,
    entry: ModelManifestEntry,
    cache: PathBuf,
) -> toolwarden::Result<PathBuf> {
    tokio::task::spawn_blocking(move || downloader.download(&entry, &cache))
        .await
        .unwrap()
}

// ============================================================================
// Downloader Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_download_lands_in_cache() {
    let (endpoint, host) = serve(None).await;
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let downloader = HuggingFaceDownloader::new(endpoint, None).unwrap();

    let cached = download(
        downloader,
        entry("unet/model.safetensors", "models/unet"),
        cache.clone(),
    )
    .await
    .unwrap();

    assert_eq!(cached, cache.join("unet/model.safetensors"));
    assert_eq!(
        fs::read_to_string(&cached).unwrap(),
        body_for("org", "model", "main", "unet/model.safetensors")
    );
    assert!(!partial_path(&cached).exists());
    assert_eq!(host.hits(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cached_file_is_reused() {
    let (endpoint, host) = serve(None).await;
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    fs::create_dir_all(&cache).unwrap();
    fs::write(cache.join("vae.pt"), "from an earlier pass").unwrap();

    let cached = download(
        HuggingFaceDownloader::new(endpoint, None).unwrap(),
        entry("vae.pt", "models/vae"),
        cache,
    )
    .await
    .unwrap();

    assert_eq!(fs::read_to_string(cached).unwrap(), "from an earlier pass");
    assert_eq!(host.hits(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_error_is_download_error() {
    let (endpoint, _host) = serve(None).await;
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");

    let err = download(
        HuggingFaceDownloader::new(endpoint, None).unwrap(),
        entry("missing.bin", "models"),
        cache.clone(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Download);
    assert!(err.to_string().contains("404"));
    assert!(!cache.join("missing.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_is_sent_as_bearer() {
    let (endpoint, host) = serve(Some("hf_secret")).await;
    let temp = TempDir::new().unwrap();

    let denied = download(
        HuggingFaceDownloader::new(endpoint.clone(), None).unwrap(),
        entry("a.bin", "models"),
        temp.path().join("denied"),
    )
    .await
    .unwrap_err();
    assert!(denied.to_string().contains("401"));

    download(
        HuggingFaceDownloader::new(endpoint, Some("hf_secret".to_string())).unwrap(),
        entry("a.bin", "models"),
        temp.path().join("allowed"),
    )
    .await
    .unwrap();
    assert_eq!(host.hits(), 2);
}

#[test]
fn test_empty_endpoint_is_config_error() {
    let err = HuggingFaceDownloader::new("/", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

// ============================================================================
// Fetcher Tests
// ============================================================================

fn write_manifest(root: &FsPath) -> PathBuf {
    let manifest = root.join("models.toml");
    fs::write(
        &manifest,
        r#"
[[huggingface]]
repo_id = "org/model"
filename = "checkpoints/base.safetensors"
revision = "main"
local_dir = "models/checkpoints"

[[huggingface]]
repo_id = "org/model"
filename = "vae.pt"
revision = "v2"
local_dir = "models/vae"
"#,
    )
    .unwrap();
    manifest
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_installs_missing_assets() {
    let (endpoint, host) = serve(None).await;
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("install");
    fs::create_dir_all(root.join("models/vae")).unwrap();
    fs::write(root.join("models/vae/vae.pt"), "already here").unwrap();
    let manifest = write_manifest(&root);
    let cache = root.join(".cache/models");

    let downloader = HuggingFaceDownloader::new(endpoint, None).unwrap();
    let fetcher = ModelAssetFetcher::new(Arc::new(downloader));
    let install_root = root.clone();
    let report = tokio::task::spawn_blocking(move || {
        fetcher.fetch(&manifest, &cache, &install_root)
    })
    .await
    .unwrap()
    .unwrap();

    let checkpoint = root.join("models/checkpoints/base.safetensors");
    assert_eq!(report.downloaded, vec![checkpoint.clone()]);
    assert_eq!(report.skipped, vec![root.join("models/vae/vae.pt")]);
    assert_eq!(
        fs::read_to_string(&checkpoint).unwrap(),
        body_for("org", "model", "main", "checkpoints/base.safetensors")
    );
    assert_eq!(
        fs::read_to_string(root.join("models/vae/vae.pt")).unwrap(),
        "already here"
    );
    assert!(!root.join(".cache/models/checkpoints/base.safetensors").exists());
    assert_eq!(host.hits(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_manifest_downloads_nothing() {
    let (endpoint, host) = serve(None).await;
    let temp = TempDir::new().unwrap();
    let manifest = temp.path().join("models.toml");
    fs::write(
        &manifest,
        "[[huggingface]]\nrepo_id = \"org/model\"\nfilename = \"a.bin\"\nrevision = \"main\"\nlocal_dir = \"models\"\n\n[[huggingface]]\nrepo_id = \"org/other\"\nfilename = \"b.bin\"\n",
    )
    .unwrap();

    let downloader = HuggingFaceDownloader::new(endpoint, None).unwrap();
    let fetcher = ModelAssetFetcher::new(Arc::new(downloader));
    let root = temp.path().to_path_buf();
    let err = tokio::task::spawn_blocking(move || {
        fetcher.fetch(&manifest, &root.join("cache"), &root)
    })
    .await
    .unwrap()
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Manifest);
    assert_eq!(host.hits(), 0);
}
