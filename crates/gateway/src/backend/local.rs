//! Local disk backend.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use protocol::ResourceKind;
use tracing::debug;

use super::{epoch_secs, BackendAdapter, NativeMetadata};

/// Backend over the local file system via `std::fs`.
///
/// Symlinks are followed. [`locate`](BackendAdapter::locate) canonicalizes
/// the longest existing prefix of a path, so a link pointing outside the
/// sandbox root resolves to its real target and fails the containment check.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Creates a local disk backend.
    pub fn new() -> Self {
        Self
    }

    fn list_children(&self, dir: &Path, want: ResourceKind) -> io::Result<Vec<PathBuf>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(dir)? {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();
            // Follow links; dangling ones are skipped.
            let Ok(meta) = fs::metadata(&path) else {
                debug!(path = %path.display(), "Skipping unreadable directory entry");
                continue;
            };
            let matches = match want {
                ResourceKind::Folder => meta.is_dir(),
                ResourceKind::File => meta.is_file(),
            };
            if matches {
                children.push(path);
            }
        }
        children.sort();
        Ok(children)
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        if fs::metadata(&source)?.is_dir() {
            copy_tree(&source, &target)?;
        } else {
            fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

fn ensure_absent(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "target already exists",
        ));
    }
    Ok(())
}

impl BackendAdapter for LocalBackend {
    type Handle = PathBuf;
    type Reader = File;
    type Writer = File;

    fn locate(&self, path: &Path) -> io::Result<PathBuf> {
        let mut current = path.to_path_buf();
        let mut missing: Vec<OsString> = Vec::new();

        loop {
            if fs::symlink_metadata(&current).is_ok() {
                let mut located = fs::canonicalize(&current)?;
                for component in missing.into_iter().rev() {
                    located.push(component);
                }
                return Ok(located);
            }
            match (current.file_name(), current.parent()) {
                (Some(name), Some(parent)) => {
                    missing.push(name.to_os_string());
                    current = parent.to_path_buf();
                }
                _ => return Ok(path.to_path_buf()),
            }
        }
    }

    fn metadata(&self, handle: &PathBuf) -> io::Result<Option<NativeMetadata>> {
        let meta = match fs::metadata(handle) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let kind = if meta.is_dir() {
            ResourceKind::Folder
        } else if meta.is_file() {
            ResourceKind::File
        } else {
            // Sockets, devices and the like are not addressable.
            return Ok(None);
        };

        Ok(Some(NativeMetadata {
            kind,
            length: if meta.is_file() { meta.len() } else { 0 },
            created: meta.created().map(epoch_secs).unwrap_or(0),
            modified: meta.modified().map(epoch_secs).unwrap_or(0),
            read_only: meta.permissions().readonly(),
        }))
    }

    fn create_folder(&self, handle: &PathBuf) -> io::Result<()> {
        fs::create_dir(handle)
    }

    fn delete_folder(&self, handle: &PathBuf) -> io::Result<()> {
        fs::remove_dir_all(handle)
    }

    fn delete_file(&self, handle: &PathBuf) -> io::Result<()> {
        fs::remove_file(handle)
    }

    fn move_folder(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        ensure_absent(to)?;
        fs::rename(from, to)
    }

    fn move_file(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        ensure_absent(to)?;
        fs::rename(from, to)
    }

    fn replace_file(&self, staged: &PathBuf, target: &PathBuf) -> io::Result<()> {
        if fs::symlink_metadata(target).is_ok_and(|meta| meta.is_dir()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a folder exists at the target",
            ));
        }
        fs::rename(staged, target)
    }

    fn copy_folder(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        ensure_absent(to)?;
        copy_tree(from, to)
    }

    fn copy_file(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        ensure_absent(to)?;
        fs::copy(from, to).map(|_| ())
    }

    fn list_child_folders(&self, handle: &PathBuf) -> io::Result<Vec<PathBuf>> {
        self.list_children(handle, ResourceKind::Folder)
    }

    fn list_child_files(&self, handle: &PathBuf) -> io::Result<Vec<PathBuf>> {
        self.list_children(handle, ResourceKind::File)
    }

    fn open_read(&self, handle: &PathBuf) -> io::Result<File> {
        File::open(handle)
    }

    fn open_write(&self, handle: &PathBuf, truncate: bool) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(handle)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
