//! Conversions between absolute, root-relative and qualified path forms.
//!
//! Pure functions only; nothing here touches a backend.

use std::path::{Component, Path, PathBuf};

use protocol::{VfsError, VfsResult};

/// Sentinel prefix marking a path as relative to the configured root.
///
/// `vfs:/` alone denotes the root itself, `vfs:/a/b` denotes `a/b` below it.
pub const RELATIVE_ROOT: &str = "vfs:/";

const RELATIVE_SCHEME: &str = "vfs:";

/// Whether qualified identifiers fold case on this platform.
const CASE_INSENSITIVE: bool = cfg!(any(windows, target_os = "macos"));

/// Root of the whole backend namespace when no root is configured.
pub fn machine_root() -> PathBuf {
    PathBuf::from(std::path::MAIN_SEPARATOR_STR)
}

/// Lexically normalize a path: drop `.`, resolve `..`, strip trailing separators.
///
/// `..` never climbs above the filesystem root. Does not touch the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::ParentDir) | None => out.push(".."),
                _ => {}
            },
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Translate a client-submitted path into a normalized absolute path.
///
/// An empty path maps to the root (or the machine root if none is configured).
/// The relative-root sentinel is stripped and the remainder joined to the
/// root. Absolute input is kept as is. Anything relative without a configured
/// root is an `InvalidPath`.
pub fn to_absolute(path: &str, root: Option<&Path>) -> VfsResult<PathBuf> {
    let trimmed = path.trim();
    if trimmed.contains('\0') {
        return Err(VfsError::invalid_path("path contains a NUL character"));
    }

    if trimmed.is_empty() {
        return Ok(root.map_or_else(machine_root, normalize));
    }

    if let Some(rest) = trimmed.strip_prefix(RELATIVE_SCHEME) {
        let root = root.ok_or_else(|| {
            VfsError::invalid_path(format!(
                "root-relative path without a configured root: {trimmed}"
            ))
        })?;
        let rest = rest.trim_start_matches(['/', '\\']);
        return Ok(normalize(&root.join(rest)));
    }

    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return Ok(normalize(candidate));
    }

    match root {
        Some(root) => Ok(normalize(&root.join(candidate))),
        None => Err(VfsError::invalid_path(format!(
            "relative path without a configured root: {trimmed}"
        ))),
    }
}

/// Translate an absolute path into its root-relative form.
///
/// Without a root the path is returned unchanged. The root itself maps to
/// [`RELATIVE_ROOT`].
pub fn to_relative(absolute: &Path, root: Option<&Path>) -> VfsResult<String> {
    let Some(root) = root else {
        return Ok(absolute.to_string_lossy().into_owned());
    };

    let absolute = normalize(absolute);
    let root = normalize(root);
    if qualified_id(&absolute) == qualified_id(&root) {
        return Ok(RELATIVE_ROOT.to_string());
    }

    let rest = absolute
        .strip_prefix(&root)
        .map_err(|_| VfsError::invalid_path("path lies outside the configured root"))?;

    let parts: Vec<String> = rest
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(format!("{RELATIVE_ROOT}{}", parts.join("/")))
}

/// Canonical identity of a path for locking and auditing.
///
/// Two spellings of the same location yield the same identifier. Case is
/// folded only where the platform file system is case-insensitive.
pub fn qualified_id(path: &Path) -> String {
    let id = normalize(path).to_string_lossy().into_owned();
    if CASE_INSENSITIVE {
        id.to_lowercase()
    } else {
        id
    }
}

/// Qualified ids of every folder strictly between `root` and `path`,
/// root-most first.
pub fn lock_ancestors(root: &Path, path: &Path) -> Vec<String> {
    let root_id = qualified_id(root);
    if qualified_id(path) == root_id {
        return Vec::new();
    }

    let mut chain = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        let id = qualified_id(dir);
        if id == root_id {
            break;
        }
        chain.push(id);
        current = dir.parent();
    }
    chain.reverse();
    chain
}
