//! Platform-specific path conventions.
//!
//! Virtual environments lay out their interpreter differently on Windows
//! (`Scripts/python.exe`) and everywhere else (`bin/python`).

use std::path::{Path, PathBuf};

/// Name of the directory holding executables inside a virtual environment.
#[must_use]
pub fn venv_bin_dir() -> &'static str {
    if cfg!(windows) { "Scripts" } else { "bin" }
}

/// Appends the platform executable suffix to `stem`.
#[must_use]
pub fn executable_name(stem: &str) -> String {
    format!("{}{}", stem, std::env::consts::EXE_SUFFIX)
}

/// Interpreter used to create environments when none is configured.
#[must_use]
pub fn default_interpreter() -> &'static str {
    if cfg!(windows) { "python" } else { "python3" }
}

/// Path of the interpreter inside the environment rooted at `venv_root`.
#[must_use]
pub fn venv_interpreter(venv_root: &Path) -> PathBuf {
    venv_root
        .join(venv_bin_dir())
        .join(executable_name("python"))
}
