//! Storage backends.
//!
//! A [`BackendAdapter`] supplies raw byte I/O, enumeration and native
//! structural operations. It works on already validated locations and never
//! decides policy: sandboxing, authorization and locking all happen in the
//! gateway before a backend call is made.
//!
//! Backends report failures as [`std::io::Error`]; the gateway re-wraps them
//! so native messages (which may carry absolute paths) never reach clients.

pub mod local;
pub mod memory;

use std::fmt::Debug;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use protocol::ResourceKind;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// What a backend knows about an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeMetadata {
    /// File or folder.
    pub kind: ResourceKind,
    /// Size in bytes (0 for folders).
    pub length: u64,
    /// Creation time, Unix seconds (0 if unknown).
    pub created: u64,
    /// Modification time, Unix seconds (0 if unknown).
    pub modified: u64,
    /// Whether the entry is read-only.
    pub read_only: bool,
}

/// Byte-level storage provider.
///
/// Handles are produced by [`locate`](Self::locate) and identify an entry in
/// backend-native form. The gateway checks the located handle against the
/// sandbox root as well, so `locate` must resolve any aliasing the backend
/// supports (symlinks, mount points).
pub trait BackendAdapter: Send + Sync + 'static {
    /// Native location of an entry.
    type Handle: AsRef<Path> + Clone + Debug + Send + Sync;
    /// Stream returned by [`open_read`](Self::open_read).
    type Reader: Read + Seek + Send;
    /// Stream returned by [`open_write`](Self::open_write).
    type Writer: Write + Seek + Send;

    /// Resolve an absolute, lexically normalized path to a native handle.
    ///
    /// The entry does not need to exist.
    fn locate(&self, path: &Path) -> io::Result<Self::Handle>;

    /// Metadata for the entry, `None` if it does not exist.
    fn metadata(&self, handle: &Self::Handle) -> io::Result<Option<NativeMetadata>>;

    /// Create a single folder. The parent must exist.
    fn create_folder(&self, handle: &Self::Handle) -> io::Result<()>;

    /// Delete a folder and everything below it.
    fn delete_folder(&self, handle: &Self::Handle) -> io::Result<()>;

    /// Delete a file.
    fn delete_file(&self, handle: &Self::Handle) -> io::Result<()>;

    /// Move a folder with its contents. The target must not exist.
    fn move_folder(&self, from: &Self::Handle, to: &Self::Handle) -> io::Result<()>;

    /// Move a file. The target must not exist.
    fn move_file(&self, from: &Self::Handle, to: &Self::Handle) -> io::Result<()>;

    /// Move a staged file onto `target`, replacing any file already there.
    ///
    /// Both handles must lie in the same folder. Readers of `target` see
    /// either the old or the new contents.
    fn replace_file(&self, staged: &Self::Handle, target: &Self::Handle) -> io::Result<()>;

    /// Copy a folder recursively. The target must not exist.
    fn copy_folder(&self, from: &Self::Handle, to: &Self::Handle) -> io::Result<()>;

    /// Copy a file. The target must not exist.
    fn copy_file(&self, from: &Self::Handle, to: &Self::Handle) -> io::Result<()>;

    /// Absolute paths of the immediate child folders.
    fn list_child_folders(&self, handle: &Self::Handle) -> io::Result<Vec<PathBuf>>;

    /// Absolute paths of the immediate child files.
    fn list_child_files(&self, handle: &Self::Handle) -> io::Result<Vec<PathBuf>>;

    /// Open a file for reading.
    fn open_read(&self, handle: &Self::Handle) -> io::Result<Self::Reader>;

    /// Open a file for writing, creating it if needed.
    ///
    /// With `truncate` the existing contents are discarded.
    fn open_write(&self, handle: &Self::Handle, truncate: bool) -> io::Result<Self::Writer>;

    /// Returns true if anything exists at `path`.
    fn exists(&self, path: &Path) -> bool;
}

/// Content type derived from a file name's extension.
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "toml" => "application/toml",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Seconds since the Unix epoch, 0 for times before it.
pub(crate) fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time in Unix seconds.
pub(crate) fn now_secs() -> u64 {
    epoch_secs(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("notes.TXT"), "text/plain");
        assert_eq!(content_type_for("a/b/photo.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("archive"), "application/octet-stream");
        assert_eq!(content_type_for(".bashrc"), "application/octet-stream");
    }

    #[test]
    fn test_epoch_secs_before_epoch_is_zero() {
        let before = SystemTime::UNIX_EPOCH - std::time::Duration::from_secs(10);
        assert_eq!(epoch_secs(before), 0);
        assert!(now_secs() > 1_600_000_000);
    }
}
