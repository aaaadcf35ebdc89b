//! Recognizing a checkout of the tool on disk.

use std::fs;
use std::path::Path;

/// Returns the repository name encoded in a remote URL.
///
/// `https://host/org/Tool.git` and `git@host:org/Tool` both yield `Tool`.
#[must_use]
pub fn repository_name(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':', '\\'])
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);

    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}

/// Reads `[project].name` from `<dir>/pyproject.toml`.
#[must_use]
pub fn read_project_name(dir: &Path) -> Option<String> {
    let content = fs::read_to_string(dir.join("pyproject.toml")).ok()?;
    let table: toml::Table = toml::from_str(&content).ok()?;
    table
        .get("project")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

/// Returns true if `dir` is a git checkout declaring `project_name`.
#[must_use]
pub fn is_tool_checkout(dir: &Path, project_name: &str) -> bool {
    dir.join(".git").exists() && read_project_name(dir).as_deref() == Some(project_name)
}

/// Returns true if `dir` is missing or an empty directory.
#[must_use]
pub fn is_missing_or_empty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => !dir.exists(),
    }
}
