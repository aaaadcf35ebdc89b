//! Integration tests for installation removal.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::time::Duration;

use tempfile::TempDir;
use toolwarden::cleanup::CleanupManager;

fn manager() -> CleanupManager {
    CleanupManager::new(5, Duration::from_millis(10))
}

fn populated_tree() -> TempDir {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("install");
    fs::create_dir_all(root.join(".git/objects/pack")).unwrap();
    fs::create_dir_all(root.join("custom_nodes/plugin")).unwrap();
    fs::write(root.join("main.py"), "print('hi')\n").unwrap();
    fs::write(root.join(".git/objects/pack/pack-1.pack"), [0u8; 64]).unwrap();
    fs::write(root.join("custom_nodes/plugin/requirements.txt"), "numpy\n").unwrap();
    temp
}

// ============================================================================
// Removal Tests
// ============================================================================

#[test]
fn test_removes_nested_tree() {
    let temp = populated_tree();
    let root = temp.path().join("install");

    let report = manager().remove_with_report(&root);

    assert!(report.removed);
    assert_eq!(report.attempts, 1);
    assert!(!root.exists());
}

#[test]
fn test_missing_path_counts_as_removed() {
    let temp = TempDir::new().unwrap();
    let report = manager().remove_with_report(&temp.path().join("never-created"));

    assert!(report.removed);
    assert_eq!(report.attempts, 0);
}

#[test]
fn test_removes_single_file() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("stray.log");
    fs::write(&file, "x").unwrap();

    assert!(manager().remove(&file));
    assert!(!file.exists());
}

#[test]
fn test_removes_read_only_files() {
    let temp = populated_tree();
    let root = temp.path().join("install");
    let pack = root.join(".git/objects/pack/pack-1.pack");
    let mut permissions = fs::metadata(&pack).unwrap().permissions();
    permissions.set_readonly(true);
    fs::set_permissions(&pack, permissions).unwrap();

    assert!(manager().remove(&root));
    assert!(!root.exists());
}

#[cfg(unix)]
#[test]
fn test_recovers_from_read_only_directory() {
    use std::os::unix::fs::PermissionsExt;

    let temp = populated_tree();
    let root = temp.path().join("install");
    let locked = root.join("custom_nodes/plugin");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

    let report = manager().remove_with_report(&root);

    assert!(report.removed, "removal should recover from a read-only directory");
    assert!(!root.exists());

    // Root ignores mode bits, so the first attempt already succeeds there.
    // SAFETY: geteuid has no preconditions.
    let is_root = unsafe { libc::geteuid() } == 0;
    if !is_root {
        assert!(report.attempts > 1, "expected a retry, got {:?}", report);
    }
}

#[test]
#[should_panic(expected = "max_attempts")]
fn test_zero_attempts_is_rejected() {
    let _ = CleanupManager::new(0, Duration::ZERO);
}
