//! Configuration module for toolwarden.
//!
//! Handles loading and parsing the `~/.toolwarden/wardenrc` file and the
//! persisted per-context state.

pub mod platform;
mod state;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use state::{InstanceRecord, StateError, StateStore};

use crate::logging::LogConfig;

/// Default wardenrc file content with all settings documented.
const DEFAULT_WARDENRC: &str = r#"# toolwarden configuration file
# =============================
# Read every time the `warden` command starts.
# Lines starting with '#' are comments.

# Repository
# ----------
# repository_url = https://github.com/comfyanonymous/ComfyUI.git
# repository_branch = master
# project_name = ComfyUI       # [project].name expected in pyproject.toml

# Runtime environment
# -------------------
# venv_directory = .venv       # Created inside the installation
# base_interpreter = python3   # Interpreter used to create the environment
# extra_index_url =            # Extra package index for backend packages
# backend_packages = torch,torchvision,torchaudio
# plugin_directory = custom_nodes

# Model assets
# ------------
# Paths are relative to the installation directory.
# Leave models_manifest empty to skip model downloads.
# models_manifest =
# models_cache = .cache/models
# models_endpoint = https://huggingface.co

# Instance
# --------
# instance_address = 127.0.0.1
# instance_port = 8188
# start_timeout = 120          # Seconds to wait for readiness
# poll_interval = 0.5          # Seconds between readiness probes
# stop_timeout = 10            # Seconds before a forced kill
# entry_script = main.py
# readiness_path = /system_stats

# Cleanup and workers
# -------------------
# cleanup_attempts = 5
# cleanup_backoff_ms = 250
# offload_workers = 4

# Logging Configuration
# ---------------------
# Logs are stored in ~/.toolwarden/logs/ with automatic cleanup.
#
# log_enabled = true       # Enable/disable file logging (true/false)
# log_level = info         # Log level: trace, debug, info, warn, error, off
# log_retention = 24       # Hours to keep log files (default: 24)
"#;

/// Returns the toolwarden home directory (~/.toolwarden).
#[must_use]
pub fn warden_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolwarden")
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Remote the tool is cloned from.
    pub repository_url: String,
    /// Branch to clone and track.
    pub repository_branch: String,
    /// Project name a valid checkout declares in `pyproject.toml`.
    pub project_name: String,
    /// Environment directory name inside the installation.
    pub venv_directory: String,
    /// Interpreter used to create the environment.
    pub base_interpreter: String,
    /// Extra package index for backend packages.
    pub extra_index_url: Option<String>,
    /// Packages installed alongside the requirement files.
    pub backend_packages: Vec<String>,
    /// Directory scanned for per-plugin requirement files.
    pub plugin_directory: String,
    /// Model manifest, relative to the installation.
    pub models_manifest: Option<PathBuf>,
    /// Model cache, relative to the installation.
    pub models_cache: PathBuf,
    /// Base URL of the model host.
    pub models_endpoint: String,
    /// Address the tool listens on.
    pub instance_address: String,
    /// Preferred port for the tool.
    pub instance_port: u16,
    /// How long to wait for readiness.
    pub start_timeout: Duration,
    /// Delay between readiness probes.
    pub poll_interval: Duration,
    /// Grace period before a forced kill.
    pub stop_timeout: Duration,
    /// Script launched inside the installation.
    pub entry_script: String,
    /// Path of the readiness endpoint.
    pub readiness_path: String,
    /// Removal attempts during cleanup.
    pub cleanup_attempts: u32,
    /// Delay between removal attempts.
    pub cleanup_backoff: Duration,
    /// Size of the blocking worker pool.
    pub offload_workers: usize,
    /// Logging configuration.
    pub log_config: LogConfig,
    /// Path to config file.
    pub config_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository_url: "https://github.com/comfyanonymous/ComfyUI.git".to_string(),
            repository_branch: "master".to_string(),
            project_name: "ComfyUI".to_string(),
            venv_directory: ".venv".to_string(),
            base_interpreter: platform::default_interpreter().to_string(),
            extra_index_url: None,
            backend_packages: vec![
                "torch".to_string(),
                "torchvision".to_string(),
                "torchaudio".to_string(),
            ],
            plugin_directory: "custom_nodes".to_string(),
            models_manifest: None,
            models_cache: PathBuf::from(".cache/models"),
            models_endpoint: "https://huggingface.co".to_string(),
            instance_address: "127.0.0.1".to_string(),
            instance_port: 8188,
            start_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            entry_script: "main.py".to_string(),
            readiness_path: "/system_stats".to_string(),
            cleanup_attempts: 5,
            cleanup_backoff: Duration::from_millis(250),
            offload_workers: 4,
            log_config: LogConfig::default(),
            config_path: Self::default_config_path(),
        }
    }
}

impl Config {
    /// Returns the default config file path (~/.toolwarden/wardenrc).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        warden_home().join("wardenrc")
    }

    /// Loads configuration from the default path, creating it if it doesn't exist.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn load() -> io::Result<Self> {
        let path = Self::default_config_path();
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path.
    ///
    /// # Errors
    /// Returns error if config cannot be read or created.
    pub fn load_from(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self::from_content(&content);
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Builds a configuration from wardenrc text.
    #[must_use]
    pub fn from_content(content: &str) -> Self {
        let mut config = Self::default();
        config.parse(content);
        config
    }

    /// Creates the default config file.
    fn create_default_config(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_WARDENRC.as_bytes())?;
        Ok(())
    }

    /// Parses the config file content.
    fn parse(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                // Remove inline comments
                let value = value.split('#').next().unwrap_or(value).trim();

                self.apply_setting(key, value);
            }
        }
    }

    /// Applies a single setting. Unparseable values keep the previous value.
    fn apply_setting(&mut self, key: &str, value: &str) {
        match key {
            "repository_url" => set_text(&mut self.repository_url, value),
            "repository_branch" => set_text(&mut self.repository_branch, value),
            "project_name" => set_text(&mut self.project_name, value),
            "venv_directory" => set_text(&mut self.venv_directory, value),
            "base_interpreter" => set_text(&mut self.base_interpreter, value),
            "extra_index_url" => self.extra_index_url = non_empty(value),
            "backend_packages" => {
                self.backend_packages = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "plugin_directory" => set_text(&mut self.plugin_directory, value),
            "models_manifest" => self.models_manifest = non_empty(value).map(PathBuf::from),
            "models_cache" => {
                if let Some(cache) = non_empty(value) {
                    self.models_cache = PathBuf::from(cache);
                }
            }
            "models_endpoint" => {
                set_text(&mut self.models_endpoint, value.trim_end_matches('/'));
            }
            "instance_address" => set_text(&mut self.instance_address, value),
            "instance_port" => {
                if let Ok(port) = value.parse() {
                    self.instance_port = port;
                }
            }
            "start_timeout" => set_seconds(&mut self.start_timeout, value),
            "poll_interval" => {
                let previous = self.poll_interval;
                set_seconds(&mut self.poll_interval, value);
                if self.poll_interval.is_zero() {
                    self.poll_interval = previous;
                }
            }
            "stop_timeout" => set_seconds(&mut self.stop_timeout, value),
            "entry_script" => set_text(&mut self.entry_script, value),
            "readiness_path" => {
                self.readiness_path = if value.starts_with('/') {
                    value.to_string()
                } else {
                    format!("/{}", value)
                };
            }
            "cleanup_attempts" => {
                if let Ok(attempts) = value.parse::<u32>() {
                    self.cleanup_attempts = attempts.max(1);
                }
            }
            "cleanup_backoff_ms" => {
                if let Ok(ms) = value.parse() {
                    self.cleanup_backoff = Duration::from_millis(ms);
                }
            }
            "offload_workers" => {
                if let Ok(workers) = value.parse::<usize>() {
                    self.offload_workers = workers.max(1);
                }
            }
            "log_level" => {
                self.log_config.level = LogConfig::parse_level(value);
            }
            "log_retention" | "log_retention_hours" => {
                self.log_config.retention_hours = LogConfig::parse_retention(value);
            }
            "log_enabled" | "logging" => {
                self.log_config.enabled = parse_bool(value);
            }
            _ => {
                tracing::debug!("[CONFIG] Ignoring unknown setting '{}'", key);
            }
        }
    }

    /// Reloads the configuration from disk.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn reload(&mut self) -> io::Result<()> {
        let path = self.config_path.clone();
        *self = Self::load_from(&path)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

/// Replaces `target` unless `value` is empty.
fn set_text(target: &mut String, value: &str) {
    if !value.is_empty() {
        *target = value.to_string();
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn set_seconds(target: &mut Duration, value: &str) {
    let parsed = value
        .parse::<f64>()
        .ok()
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok());
    if let Some(duration) = parsed {
        *target = duration;
    }
}
