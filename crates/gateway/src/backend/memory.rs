//! In-memory backend.
//!
//! Used for tests and scratch space. All data is lost when the last clone is
//! dropped.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use protocol::ResourceKind;

use super::{now_secs, BackendAdapter, NativeMetadata};
use crate::paths::normalize::{machine_root, normalize};

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        created: u64,
        modified: u64,
    },
    Folder {
        created: u64,
    },
}

impl Node {
    fn kind(&self) -> ResourceKind {
        match self {
            Node::File { .. } => ResourceKind::File,
            Node::Folder { .. } => ResourceKind::Folder,
        }
    }
}

type Tree = BTreeMap<PathBuf, Node>;

/// Thread-safe in-memory file tree.
///
/// Clones share the same tree. The machine root (`/`) always exists.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    tree: Arc<RwLock<Tree>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> io::Error {
    io::Error::other("memory backend lock poisoned")
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no such entry")
}

fn already_exists() -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, "entry already exists")
}

fn expect_kind(tree: &Tree, path: &Path, kind: ResourceKind) -> io::Result<()> {
    match tree.get(path) {
        Some(node) if node.kind() == kind => Ok(()),
        Some(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "entry has the wrong kind",
        )),
        None => Err(not_found()),
    }
}

fn ensure_parent(tree: &Tree, path: &Path) -> io::Result<()> {
    let parent = path.parent().ok_or_else(not_found)?;
    expect_kind(tree, parent, ResourceKind::Folder)
}

/// Every entry at or below `path`.
fn subtree(tree: &Tree, path: &Path) -> Vec<(PathBuf, Node)> {
    // Paths order component-wise, so descendants directly follow `path`.
    tree.range(path.to_path_buf()..)
        .take_while(|(key, _)| key.starts_with(path))
        .map(|(key, node)| (key.clone(), node.clone()))
        .collect()
}

fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
        Ok(rest) => to.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

impl MemoryBackend {
    /// Create an empty tree containing only the machine root.
    pub fn new() -> Self {
        let mut tree = Tree::new();
        tree.insert(
            machine_root(),
            Node::Folder {
                created: now_secs(),
            },
        );
        Self {
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    /// Create a folder and all missing ancestors. Test and bootstrap helper.
    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = normalize(path.as_ref());
        let mut tree = self.write()?;
        let mut chain: Vec<&Path> = path.ancestors().collect();
        chain.reverse();
        for dir in chain {
            match tree.get(dir) {
                Some(Node::Folder { .. }) => {}
                Some(Node::File { .. }) => return Err(already_exists()),
                None => {
                    tree.insert(
                        dir.to_path_buf(),
                        Node::Folder {
                            created: now_secs(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Store a file, replacing any previous contents. The parent must exist.
    pub fn put_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) -> io::Result<()> {
        let path = normalize(path.as_ref());
        let mut tree = self.write()?;
        ensure_parent(&tree, &path)?;
        store_file(&mut tree, &path, data.into())
    }

    /// Contents of a file, if present.
    pub fn file_contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let tree = self.tree.read().ok()?;
        match tree.get(&normalize(path.as_ref())) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    fn read(&self) -> io::Result<RwLockReadGuard<'_, Tree>> {
        self.tree.read().map_err(|_| poisoned())
    }

    fn write(&self) -> io::Result<RwLockWriteGuard<'_, Tree>> {
        self.tree.write().map_err(|_| poisoned())
    }

    fn list_children(&self, dir: &Path, want: ResourceKind) -> io::Result<Vec<PathBuf>> {
        let tree = self.read()?;
        expect_kind(&tree, dir, ResourceKind::Folder)?;
        Ok(tree
            .iter()
            .filter(|(key, node)| key.parent() == Some(dir) && node.kind() == want)
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn transplant(&self, from: &Path, to: &Path, kind: ResourceKind, keep: bool) -> io::Result<()> {
        let mut tree = self.write()?;
        expect_kind(&tree, from, kind)?;
        if tree.contains_key(to) {
            return Err(already_exists());
        }
        ensure_parent(&tree, to)?;
        if to.starts_with(from) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot place an entry inside itself",
            ));
        }

        let entries = subtree(&tree, from);
        if !keep {
            for (key, _) in &entries {
                tree.remove(key);
            }
        }
        let now = now_secs();
        for (key, node) in entries {
            let node = match (keep, node) {
                (true, Node::File { data, .. }) => Node::File {
                    data,
                    created: now,
                    modified: now,
                },
                (true, Node::Folder { .. }) => Node::Folder { created: now },
                (false, node) => node,
            };
            tree.insert(rebase(&key, from, to), node);
        }
        Ok(())
    }
}

fn store_file(tree: &mut Tree, path: &Path, data: Vec<u8>) -> io::Result<()> {
    let now = now_secs();
    match tree.get_mut(path) {
        Some(Node::File {
            data: existing,
            modified,
            ..
        }) => {
            *existing = data;
            *modified = now;
            Ok(())
        }
        Some(Node::Folder { .. }) => Err(already_exists()),
        None => {
            tree.insert(
                path.to_path_buf(),
                Node::File {
                    data,
                    created: now,
                    modified: now,
                },
            );
            Ok(())
        }
    }
}

/// Write stream into a [`MemoryBackend`] file.
///
/// Bytes are buffered and stored on [`flush`](Write::flush) and on drop.
#[derive(Debug)]
pub struct MemoryWriter {
    tree: Arc<RwLock<Tree>>,
    path: PathBuf,
    buffer: Cursor<Vec<u8>>,
    dirty: bool,
}

impl MemoryWriter {
    fn commit(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut tree = self.tree.write().map_err(|_| poisoned())?;
        store_file(&mut tree, &self.path, self.buffer.get_ref().clone())?;
        self.dirty = false;
        Ok(())
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.dirty = true;
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit()
    }
}

impl Seek for MemoryWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buffer.seek(pos)
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to store buffered file contents");
        }
    }
}

/// Read stream over a snapshot of a [`MemoryBackend`] file.
#[derive(Debug)]
pub struct MemoryReader(Cursor<Vec<u8>>);

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl BackendAdapter for MemoryBackend {
    type Handle = PathBuf;
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn locate(&self, path: &Path) -> io::Result<PathBuf> {
        if !path.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "memory backend paths must be absolute",
            ));
        }
        Ok(normalize(path))
    }

    fn metadata(&self, handle: &PathBuf) -> io::Result<Option<NativeMetadata>> {
        let tree = self.read()?;
        Ok(tree.get(handle).map(|node| match node {
            Node::File {
                data,
                created,
                modified,
            } => NativeMetadata {
                kind: ResourceKind::File,
                length: data.len() as u64,
                created: *created,
                modified: *modified,
                read_only: false,
            },
            Node::Folder { created } => NativeMetadata {
                kind: ResourceKind::Folder,
                length: 0,
                created: *created,
                modified: *created,
                read_only: false,
            },
        }))
    }

    fn create_folder(&self, handle: &PathBuf) -> io::Result<()> {
        let mut tree = self.write()?;
        if tree.contains_key(handle) {
            return Err(already_exists());
        }
        ensure_parent(&tree, handle)?;
        tree.insert(
            handle.clone(),
            Node::Folder {
                created: now_secs(),
            },
        );
        Ok(())
    }

    fn delete_folder(&self, handle: &PathBuf) -> io::Result<()> {
        let mut tree = self.write()?;
        expect_kind(&tree, handle, ResourceKind::Folder)?;
        for (key, _) in subtree(&tree, handle) {
            tree.remove(&key);
        }
        Ok(())
    }

    fn delete_file(&self, handle: &PathBuf) -> io::Result<()> {
        let mut tree = self.write()?;
        expect_kind(&tree, handle, ResourceKind::File)?;
        tree.remove(handle);
        Ok(())
    }

    fn move_folder(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        self.transplant(from, to, ResourceKind::Folder, false)
    }

    fn move_file(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        self.transplant(from, to, ResourceKind::File, false)
    }

    fn replace_file(&self, staged: &PathBuf, target: &PathBuf) -> io::Result<()> {
        let mut tree = self.write()?;
        expect_kind(&tree, staged, ResourceKind::File)?;
        ensure_parent(&tree, target)?;
        if matches!(tree.get(target), Some(Node::Folder { .. })) {
            return Err(already_exists());
        }
        match tree.remove(staged) {
            Some(Node::File { data, .. }) => store_file(&mut tree, target, data),
            _ => Err(not_found()),
        }
    }

    fn copy_folder(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        self.transplant(from, to, ResourceKind::Folder, true)
    }

    fn copy_file(&self, from: &PathBuf, to: &PathBuf) -> io::Result<()> {
        self.transplant(from, to, ResourceKind::File, true)
    }

    fn list_child_folders(&self, handle: &PathBuf) -> io::Result<Vec<PathBuf>> {
        self.list_children(handle, ResourceKind::Folder)
    }

    fn list_child_files(&self, handle: &PathBuf) -> io::Result<Vec<PathBuf>> {
        self.list_children(handle, ResourceKind::File)
    }

    fn open_read(&self, handle: &PathBuf) -> io::Result<MemoryReader> {
        let tree = self.read()?;
        match tree.get(handle) {
            Some(Node::File { data, .. }) => Ok(MemoryReader(Cursor::new(data.clone()))),
            Some(Node::Folder { .. }) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read a folder",
            )),
            None => Err(not_found()),
        }
    }

    fn open_write(&self, handle: &PathBuf, truncate: bool) -> io::Result<MemoryWriter> {
        let mut tree = self.write()?;
        ensure_parent(&tree, handle)?;
        let initial = match tree.get(handle) {
            Some(Node::File { data, .. }) if !truncate => data.clone(),
            Some(Node::File { .. }) => Vec::new(),
            Some(Node::Folder { .. }) => return Err(already_exists()),
            None => Vec::new(),
        };
        // The file exists as soon as it is opened, like on disk.
        store_file(&mut tree, handle, initial.clone())?;

        Ok(MemoryWriter {
            tree: Arc::clone(&self.tree),
            path: handle.clone(),
            buffer: Cursor::new(initial),
            dirty: false,
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.read()
            .map(|tree| tree.contains_key(&normalize(path)))
            .unwrap_or(false)
    }
}
