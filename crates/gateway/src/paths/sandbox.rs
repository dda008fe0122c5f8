//! Sandbox containment checks.
//!
//! Containment is decided by walking the candidate's ancestor chain folder by
//! folder and comparing qualified identifiers, never by string prefix. A
//! prefix test would accept `/data-private` for root `/data`.

use std::path::Path;

use tracing::warn;

use super::normalize::{normalize, qualified_id};

/// Returns true if `candidate` is `root` or lies below it.
///
/// Relative candidates are never contained.
pub fn is_contained_in(root: &Path, candidate: &Path) -> bool {
    if !candidate.is_absolute() {
        warn!(candidate = %candidate.display(), "Rejecting relative path in containment check");
        return false;
    }

    let root_id = qualified_id(root);
    let candidate = normalize(candidate);

    let mut current = Some(candidate.as_path());
    while let Some(dir) = current {
        if qualified_id(dir) == root_id {
            return true;
        }
        current = dir.parent();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_contained_paths() {
        let root = Path::new("/data");
        assert!(is_contained_in(root, Path::new("/data")));
        assert!(is_contained_in(root, Path::new("/data/")));
        assert!(is_contained_in(root, Path::new("/data/a/b.txt")));
    }

    #[cfg(unix)]
    #[test]
    fn test_sibling_with_common_prefix_is_outside() {
        let root = Path::new("/data");
        assert!(!is_contained_in(root, Path::new("/data-private/x")));
        assert!(!is_contained_in(root, Path::new("/dat")));
    }

    #[cfg(unix)]
    #[test]
    fn test_parent_traversal_is_outside() {
        let root = Path::new("/data");
        assert!(!is_contained_in(root, Path::new("/data/../etc/passwd")));
        assert!(!is_contained_in(root, Path::new("/data/a/../../etc")));
        assert!(is_contained_in(root, Path::new("/data/a/../b")));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn test_case_differences_matter_on_case_sensitive_systems() {
        let root = Path::new("/data");
        assert!(!is_contained_in(root, Path::new("/DATA/a")));
    }

    #[cfg(windows)]
    #[test]
    fn test_drive_letter_case_is_ignored() {
        let root = Path::new(r"C:\data");
        assert!(is_contained_in(root, Path::new(r"c:\data\a.txt")));
        assert!(!is_contained_in(root, Path::new(r"d:\data\a.txt")));
    }

    #[test]
    fn test_relative_candidate_is_outside() {
        let root = std::env::temp_dir();
        assert!(!is_contained_in(&root, Path::new("a/b")));
    }

    #[cfg(unix)]
    #[test]
    fn test_machine_root_contains_everything_absolute() {
        assert!(is_contained_in(Path::new("/"), Path::new("/etc/hosts")));
    }
}
