//! Operation orchestrator.
//!
//! Every operation runs the same pipeline: resolve the resources involved,
//! check the claims for the specific action, reject degenerate requests,
//! take chain locks, call the backend, re-resolve for fresh metadata and
//! report the outcome to the audit sink exactly once.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use protocol::{FolderContents, ResourceInfo, ResourceKind, VfsError, VfsResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{audit, AuditSink, Operation, TracingAuditSink};
use crate::auth::{AllowAll, AuthorizationProvider, PermissionAuthorizer};
use crate::backend::BackendAdapter;
use crate::config::Config;
use crate::locking::{ChainLockGuard, ChainLockManager, LockKind, LockRegistry};
use crate::paths::sandbox::is_contained_in;
use crate::paths::{ResourceItem, Resolver, RootConfig};
use crate::transfer::TransferSettings;

type Item<B> = ResourceItem<<B as BackendAdapter>::Handle>;

/// Read stream that keeps its file read-locked until dropped.
#[derive(Debug)]
pub struct LockedReader<R> {
    reader: R,
    info: ResourceInfo,
    _guard: ChainLockGuard,
}

impl<R> LockedReader<R> {
    /// Metadata of the file being read.
    pub fn info(&self) -> &ResourceInfo {
        &self.info
    }
}

impl<R: Read> Read for LockedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<R: Seek> Seek for LockedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

/// Builder for [`VfsGateway`].
pub struct GatewayBuilder<B: BackendAdapter> {
    backend: B,
    roots: RootConfig,
    auth: Arc<dyn AuthorizationProvider>,
    audit: Arc<dyn AuditSink>,
    registry: Option<Arc<LockRegistry>>,
    transfer: TransferSettings,
}

impl<B: BackendAdapter> GatewayBuilder<B> {
    /// Start from an unrestricted gateway that allows everything.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            roots: RootConfig::unrestricted(),
            auth: Arc::new(AllowAll),
            audit: Arc::new(TracingAuditSink),
            registry: None,
            transfer: TransferSettings::default(),
        }
    }

    /// Wire a gateway from loaded configuration.
    pub fn from_config(backend: B, config: &Config) -> Self {
        let roots = match &config.gateway.root {
            Some(root) => {
                RootConfig::sandboxed(root.clone()).relative_paths(config.gateway.relative_paths)
            }
            None => RootConfig::unrestricted().relative_paths(config.gateway.relative_paths),
        };

        let auth = PermissionAuthorizer::new(config.access.default_level)
            .with_rules(config.access.rules.iter().cloned());

        Self::new(backend)
            .roots(roots)
            .authorizer(auth)
            .transfer_settings(config.transfer.settings())
    }

    /// Confine the gateway to `root`.
    pub fn root(mut self, root: impl AsRef<Path>) -> Self {
        let relative = self.roots.uses_relative_paths();
        self.roots = RootConfig::sandboxed(root.as_ref()).relative_paths(relative);
        self
    }

    /// Report root-relative paths to clients.
    pub fn relative_paths(mut self, enabled: bool) -> Self {
        self.roots = self.roots.relative_paths(enabled);
        self
    }

    pub fn roots(mut self, roots: RootConfig) -> Self {
        self.roots = roots;
        self
    }

    pub fn authorizer(mut self, auth: impl AuthorizationProvider + 'static) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Share a lock registry with other gateways over the same storage.
    pub fn lock_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transfer_settings(mut self, settings: TransferSettings) -> Self {
        self.transfer = settings;
        self
    }

    /// Build the gateway. Fails on an inconsistent root configuration.
    pub fn build(self) -> VfsResult<VfsGateway<B>> {
        let resolver = Resolver::new(Arc::new(self.backend), self.roots, self.auth)?;
        let locks = match self.registry {
            Some(registry) => ChainLockManager::with_registry(registry),
            None => ChainLockManager::new(),
        };
        info!(
            root = %resolver.root_path().display(),
            relative_paths = resolver.config().uses_relative_paths(),
            "VFS gateway ready"
        );
        Ok(VfsGateway {
            resolver,
            locks,
            audit: self.audit,
            transfer: self.transfer,
        })
    }
}

/// Backend-agnostic file and folder operations.
///
/// Construct once and share by reference (or `Arc`) with whatever transport
/// needs it.
pub struct VfsGateway<B: BackendAdapter> {
    resolver: Resolver<B>,
    locks: ChainLockManager,
    audit: Arc<dyn AuditSink>,
    transfer: TransferSettings,
}

impl<B: BackendAdapter> std::fmt::Debug for VfsGateway<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsGateway")
            .field("resolver", &self.resolver)
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

fn name_filter(filter: Option<&str>) -> VfsResult<Option<GlobMatcher>> {
    filter
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            Glob::new(pattern)
                .map(|glob| glob.compile_matcher())
                .map_err(|_| VfsError::invalid_path(format!("invalid filter: {pattern}")))
        })
        .transpose()
}

fn validate_name(name: &str) -> VfsResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(VfsError::invalid_path(format!("invalid name: {name:?}")));
    }
    Ok(())
}

impl<B: BackendAdapter> VfsGateway<B> {
    /// Shortcut for [`GatewayBuilder::new`].
    pub fn builder(backend: B) -> GatewayBuilder<B> {
        GatewayBuilder::new(backend)
    }

    pub fn resolver(&self) -> &Resolver<B> {
        &self.resolver
    }

    pub fn backend(&self) -> &B {
        self.resolver.backend()
    }

    pub fn locks(&self) -> &ChainLockManager {
        &self.locks
    }

    pub fn transfer_settings(&self) -> &TransferSettings {
        &self.transfer
    }

    pub(crate) fn run<T>(
        &self,
        operation: Operation,
        resource: &str,
        f: impl FnOnce() -> VfsResult<T>,
    ) -> VfsResult<T> {
        audit(self.audit.as_ref(), operation, resource, f())
    }

    /// Take a chain lock on a resolved item or fail with `ResourceLocked`.
    pub(crate) fn lock(&self, item: &Item<B>, kind: LockKind) -> VfsResult<ChainLockGuard> {
        let guard = self.locks.acquire(&item.qualified_id, kind, &item.ancestor_ids);
        if guard.is_enabled() {
            Ok(guard)
        } else {
            warn!(path = %item.info.full_name, ?kind, "Resource is locked");
            Err(VfsError::locked(format!(
                "resource is locked: {}",
                item.info.full_name
            )))
        }
    }

    /// Resolve the folder a new resource would be created in.
    fn creation_parent(&self, target: &Item<B>, operation: Operation) -> VfsResult<Item<B>> {
        let parent_path = target.native_path.parent().ok_or_else(|| {
            VfsError::access_denied(format!("cannot create at {}", target.info.full_name))
        })?;
        let parent = self
            .resolver
            .resolve_native(parent_path, ResourceKind::Folder, true, operation)?;

        if parent.is_root && self.resolver.config().root().is_none() {
            return Err(VfsError::access_denied(
                "resources cannot be created at the machine root",
            ));
        }
        Ok(parent)
    }

    /// Hidden sibling of `target` that receives new contents until they
    /// replace it.
    pub(crate) fn staging_handle(&self, target: &Item<B>, tag: &str) -> VfsResult<B::Handle> {
        let path = target.handle.as_ref();
        let name = path.file_name().ok_or_else(|| {
            VfsError::access_denied(format!("cannot write {}", target.info.full_name))
        })?;
        let staged = path.with_file_name(format!(".{}.{tag}.partial", name.to_string_lossy()));
        self.resolver
            .backend()
            .locate(&staged)
            .map_err(|e| VfsError::backend("could not prepare staging file", e))
    }

    /// Remove a staging file, if it was created.
    pub(crate) fn discard_staged(&self, staged: &B::Handle) {
        let backend = self.resolver.backend();
        if !backend.exists(staged.as_ref()) {
            return;
        }
        if let Err(e) = backend.delete_file(staged) {
            warn!(path = %staged.as_ref().display(), error = %e, "Failed to remove staging file");
        }
    }

    /// Resolve a file for reading and check the read claim.
    pub(crate) fn prepare_read(&self, path: &str, operation: Operation) -> VfsResult<Item<B>> {
        let item = self
            .resolver
            .resolve(path, ResourceKind::File, true, operation)?;
        if !self.resolver.file_claims(&item, operation).allow_read_data {
            return Err(VfsError::access_denied(format!(
                "reading is not permitted: {}",
                item.info.full_name
            )));
        }
        Ok(item)
    }

    /// Resolve a file for writing and check overwrite rules and claims.
    ///
    /// Returns the target and whether it already existed.
    pub(crate) fn prepare_write(
        &self,
        path: &str,
        overwrite: bool,
        operation: Operation,
    ) -> VfsResult<(Item<B>, bool)> {
        let target = self
            .resolver
            .resolve(path, ResourceKind::File, false, operation)?;

        if target.is_occupied() && !target.exists() {
            return Err(VfsError::already_exists(format!(
                "a folder exists at {}",
                target.info.full_name
            )));
        }

        if target.exists() {
            if !overwrite {
                return Err(VfsError::already_exists(format!(
                    "file already exists: {}",
                    target.info.full_name
                )));
            }
            if !self.resolver.file_claims(&target, operation).allow_overwrite {
                return Err(VfsError::access_denied(format!(
                    "overwriting is not permitted: {}",
                    target.info.full_name
                )));
            }
            return Ok((target, true));
        }

        let parent = self.creation_parent(&target, operation)?;
        if !self.resolver.folder_claims(&parent, operation).allow_add_files {
            return Err(VfsError::access_denied(format!(
                "adding files is not permitted: {}",
                parent.info.full_name
            )));
        }
        Ok((target, false))
    }

    /// Re-resolve after a mutation so the caller sees backend truth.
    pub(crate) fn refresh(
        &self,
        item: &Item<B>,
        operation: Operation,
    ) -> VfsResult<ResourceInfo> {
        self.resolver
            .resolve_native(&item.native_path, item.kind(), true, operation)
            .map(|fresh| fresh.info)
    }

    // ---- Queries ----

    /// The root folder.
    pub fn root(&self) -> VfsResult<ResourceInfo> {
        self.run(Operation::RootInfo, "", || {
            self.resolver
                .resolve("", ResourceKind::Folder, true, Operation::RootInfo)
                .map(|item| item.info)
        })
    }

    /// Metadata of an existing file.
    pub fn file_info(&self, path: &str) -> VfsResult<ResourceInfo> {
        self.run(Operation::FileInfo, path, || {
            self.resolver
                .resolve(path, ResourceKind::File, true, Operation::FileInfo)
                .map(|item| item.info)
        })
    }

    /// Metadata of an existing folder.
    pub fn folder_info(&self, path: &str) -> VfsResult<ResourceInfo> {
        self.run(Operation::FolderInfo, path, || {
            self.resolver
                .resolve(path, ResourceKind::Folder, true, Operation::FolderInfo)
                .map(|item| item.info)
        })
    }

    /// Folder containing an existing file.
    pub fn file_parent(&self, path: &str) -> VfsResult<ResourceInfo> {
        let op = Operation::FileParent;
        self.run(op, path, || {
            let file = self.resolver.resolve(path, ResourceKind::File, true, op)?;
            self.parent_of(&file, op)?
                .ok_or_else(|| VfsError::not_found(format!("no parent: {}", file.info.full_name)))
        })
    }

    /// Parent of an existing folder, `None` for the root.
    pub fn folder_parent(&self, path: &str) -> VfsResult<Option<ResourceInfo>> {
        let op = Operation::FolderParent;
        self.run(op, path, || {
            let folder = self.resolver.resolve(path, ResourceKind::Folder, true, op)?;
            self.parent_of(&folder, op)
        })
    }

    fn parent_of(&self, item: &Item<B>, operation: Operation) -> VfsResult<Option<ResourceInfo>> {
        if item.is_root {
            return Ok(None);
        }
        let Some(parent) = item.native_path.parent() else {
            return Ok(None);
        };
        self.resolver
            .resolve_native(parent, ResourceKind::Folder, true, operation)
            .map(|parent| Some(parent.info))
    }

    /// Whether a file exists at `path`.
    pub fn is_file_available(&self, path: &str) -> VfsResult<bool> {
        self.run(Operation::CheckAvailability, path, || {
            self.resolver
                .resolve(path, ResourceKind::File, false, Operation::CheckAvailability)
                .map(|item| item.exists())
        })
    }

    /// Whether a folder exists at `path`.
    pub fn is_folder_available(&self, path: &str) -> VfsResult<bool> {
        self.run(Operation::CheckAvailability, path, || {
            self.resolver
                .resolve(path, ResourceKind::Folder, false, Operation::CheckAvailability)
                .map(|item| item.exists())
        })
    }

    /// Child folders, optionally filtered by a glob on their names.
    pub fn child_folders(&self, path: &str, filter: Option<&str>) -> VfsResult<Vec<ResourceInfo>> {
        let op = Operation::ListFolders;
        self.run(op, path, || {
            let matcher = name_filter(filter)?;
            let folder = self.listable_folder(path, op)?;
            let _guard = self.lock(&folder, LockKind::Read)?;
            self.children(&folder, ResourceKind::Folder, matcher.as_ref(), op)
        })
    }

    /// Child files, optionally filtered by a glob on their names.
    pub fn child_files(&self, path: &str, filter: Option<&str>) -> VfsResult<Vec<ResourceInfo>> {
        let op = Operation::ListFiles;
        self.run(op, path, || {
            let matcher = name_filter(filter)?;
            let folder = self.listable_folder(path, op)?;
            let _guard = self.lock(&folder, LockKind::Read)?;
            self.children(&folder, ResourceKind::File, matcher.as_ref(), op)
        })
    }

    /// A folder with its child folders and files.
    pub fn folder_contents(&self, path: &str, filter: Option<&str>) -> VfsResult<FolderContents> {
        let op = Operation::FolderContents;
        self.run(op, path, || {
            let matcher = name_filter(filter)?;
            let folder = self.listable_folder(path, op)?;
            let _guard = self.lock(&folder, LockKind::Read)?;
            let folders = self.children(&folder, ResourceKind::Folder, matcher.as_ref(), op)?;
            let files = self.children(&folder, ResourceKind::File, matcher.as_ref(), op)?;
            Ok(FolderContents {
                folder: folder.info,
                folders,
                files,
            })
        })
    }

    fn listable_folder(&self, path: &str, operation: Operation) -> VfsResult<Item<B>> {
        let folder = self
            .resolver
            .resolve(path, ResourceKind::Folder, true, operation)?;
        if !self.resolver.folder_claims(&folder, operation).allow_list_contents {
            return Err(VfsError::access_denied(format!(
                "listing is not permitted: {}",
                folder.info.full_name
            )));
        }
        Ok(folder)
    }

    fn children(
        &self,
        folder: &Item<B>,
        kind: ResourceKind,
        matcher: Option<&GlobMatcher>,
        operation: Operation,
    ) -> VfsResult<Vec<ResourceInfo>> {
        let backend = self.resolver.backend();
        let paths = match kind {
            ResourceKind::Folder => backend.list_child_folders(&folder.handle),
            ResourceKind::File => backend.list_child_files(&folder.handle),
        }
        .map_err(|e| VfsError::backend("could not list folder", e))?;

        let mut children = Vec::with_capacity(paths.len());
        for child in paths {
            let Some(name) = child.file_name() else {
                continue;
            };
            if matcher.is_some_and(|m| !m.is_match(name)) {
                continue;
            }
            // Listed paths are backend-located; map them back below the
            // client-facing folder path.
            let lexical = folder.native_path.join(name);
            match self.resolver.resolve_native(&lexical, kind, false, operation) {
                Ok(item) if item.exists() => children.push(item.info),
                Ok(_) => {}
                Err(e) => debug!(path = %lexical.display(), error = %e, "Skipping child"),
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    // ---- Mutations ----

    /// Create folder `name` inside `parent`.
    pub fn create_folder(&self, parent: &str, name: &str) -> VfsResult<ResourceInfo> {
        let op = Operation::CreateFolder;
        self.run(op, parent, || {
            validate_name(name)?;
            let parent = self.resolver.resolve(parent, ResourceKind::Folder, true, op)?;
            if parent.is_root && self.resolver.config().root().is_none() {
                return Err(VfsError::access_denied(
                    "folders cannot be created at the machine root",
                ));
            }
            if !self.resolver.folder_claims(&parent, op).allow_add_folders {
                return Err(VfsError::access_denied(format!(
                    "adding folders is not permitted: {}",
                    parent.info.full_name
                )));
            }

            let target = self.resolver.resolve_native(
                &parent.native_path.join(name),
                ResourceKind::Folder,
                false,
                op,
            )?;
            if target.is_occupied() {
                return Err(VfsError::already_exists(format!(
                    "resource already exists: {}",
                    target.info.full_name
                )));
            }

            let _guard = self.lock(&target, LockKind::Write)?;
            self.resolver
                .backend()
                .create_folder(&target.handle)
                .map_err(|e| VfsError::backend("could not create folder", e))?;

            let info = self.refresh(&target, op)?;
            info!(path = %info.full_name, "Folder created");
            Ok(info)
        })
    }

    /// Delete a folder and everything in it. The root can never be deleted.
    pub fn delete_folder(&self, path: &str) -> VfsResult<()> {
        let op = Operation::DeleteFolder;
        self.run(op, path, || {
            let folder = self.resolver.resolve(path, ResourceKind::Folder, true, op)?;
            if folder.is_root {
                return Err(VfsError::access_denied("the root folder cannot be deleted"));
            }
            if !self.resolver.folder_claims(&folder, op).allow_delete {
                return Err(VfsError::access_denied(format!(
                    "deleting is not permitted: {}",
                    folder.info.full_name
                )));
            }

            let _guard = self.lock(&folder, LockKind::Write)?;
            self.resolver
                .backend()
                .delete_folder(&folder.handle)
                .map_err(|e| VfsError::backend("could not delete folder", e))?;

            info!(path = %folder.info.full_name, "Folder deleted");
            Ok(())
        })
    }

    /// Delete a file.
    pub fn delete_file(&self, path: &str) -> VfsResult<()> {
        let op = Operation::DeleteFile;
        self.run(op, path, || {
            let file = self.resolver.resolve(path, ResourceKind::File, true, op)?;
            if !self.resolver.file_claims(&file, op).allow_delete {
                return Err(VfsError::access_denied(format!(
                    "deleting is not permitted: {}",
                    file.info.full_name
                )));
            }

            let _guard = self.lock(&file, LockKind::Write)?;
            self.resolver
                .backend()
                .delete_file(&file.handle)
                .map_err(|e| VfsError::backend("could not delete file", e))?;

            info!(path = %file.info.full_name, "File deleted");
            Ok(())
        })
    }

    /// Move a folder to `destination`, which must not exist yet.
    pub fn move_folder(&self, source: &str, destination: &str) -> VfsResult<ResourceInfo> {
        self.relocate(ResourceKind::Folder, source, destination, true)
    }

    /// Copy a folder recursively to `destination`, which must not exist yet.
    pub fn copy_folder(&self, source: &str, destination: &str) -> VfsResult<ResourceInfo> {
        self.relocate(ResourceKind::Folder, source, destination, false)
    }

    /// Move a file to `destination`, which must not exist yet.
    pub fn move_file(&self, source: &str, destination: &str) -> VfsResult<ResourceInfo> {
        self.relocate(ResourceKind::File, source, destination, true)
    }

    /// Copy a file to `destination`, which must not exist yet.
    pub fn copy_file(&self, source: &str, destination: &str) -> VfsResult<ResourceInfo> {
        self.relocate(ResourceKind::File, source, destination, false)
    }

    fn relocate(
        &self,
        kind: ResourceKind,
        source: &str,
        destination: &str,
        is_move: bool,
    ) -> VfsResult<ResourceInfo> {
        let op = match (kind, is_move) {
            (ResourceKind::Folder, true) => Operation::MoveFolder,
            (ResourceKind::Folder, false) => Operation::CopyFolder,
            (ResourceKind::File, true) => Operation::MoveFile,
            (ResourceKind::File, false) => Operation::CopyFile,
        };

        self.run(op, source, || {
            let src = self.resolver.resolve(source, kind, true, op)?;
            if src.is_root {
                return Err(VfsError::access_denied("the root folder cannot be moved or copied"));
            }
            let dst = self.resolver.resolve(destination, kind, false, op)?;

            self.check_source_claims(&src, is_move, op)?;
            let parent = self.creation_parent(&dst, op)?;
            let parent_claims = self.resolver.folder_claims(&parent, op);
            let may_add = match kind {
                ResourceKind::Folder => parent_claims.allow_add_folders,
                ResourceKind::File => parent_claims.allow_add_files,
            };
            if !may_add {
                return Err(VfsError::access_denied(format!(
                    "adding {}s is not permitted: {}",
                    kind.as_str(),
                    parent.info.full_name
                )));
            }

            if src.qualified_id == dst.qualified_id {
                return Err(VfsError::access_denied(
                    "source and destination are the same resource",
                ));
            }
            if kind == ResourceKind::Folder
                && is_contained_in(src.handle.as_ref(), dst.handle.as_ref())
            {
                return Err(VfsError::access_denied(
                    "a folder cannot be placed inside itself",
                ));
            }
            if dst.is_occupied() {
                return Err(VfsError::already_exists(format!(
                    "destination already exists: {}",
                    dst.info.full_name
                )));
            }

            let source_lock = if is_move { LockKind::Write } else { LockKind::Read };
            let _src_guard = self.lock(&src, source_lock)?;
            let _dst_guard = self.lock(&dst, LockKind::Write)?;

            let backend = self.resolver.backend();
            let result = match (kind, is_move) {
                (ResourceKind::Folder, true) => backend.move_folder(&src.handle, &dst.handle),
                (ResourceKind::Folder, false) => backend.copy_folder(&src.handle, &dst.handle),
                (ResourceKind::File, true) => backend.move_file(&src.handle, &dst.handle),
                (ResourceKind::File, false) => backend.copy_file(&src.handle, &dst.handle),
            };
            result.map_err(|e| VfsError::backend(&format!("could not complete {op}"), e))?;

            let info = self.refresh(&dst, op)?;
            info!(
                operation = %op,
                from = %src.info.full_name,
                to = %info.full_name,
                "Resource relocated"
            );
            Ok(info)
        })
    }

    fn check_source_claims(&self, src: &Item<B>, is_move: bool, op: Operation) -> VfsResult<()> {
        let allowed = match (src.kind(), is_move) {
            (ResourceKind::Folder, true) => self.resolver.folder_claims(src, op).allow_delete,
            (ResourceKind::Folder, false) => {
                self.resolver.folder_claims(src, op).allow_list_contents
            }
            (ResourceKind::File, true) => self.resolver.file_claims(src, op).allow_delete,
            (ResourceKind::File, false) => self.resolver.file_claims(src, op).allow_read_data,
        };
        if allowed {
            Ok(())
        } else {
            Err(VfsError::access_denied(format!(
                "{op} is not permitted: {}",
                src.info.full_name
            )))
        }
    }

    /// Open a file for reading. The file stays read-locked until the reader
    /// is dropped.
    pub fn read_file(&self, path: &str) -> VfsResult<LockedReader<B::Reader>> {
        self.run(Operation::ReadFile, path, || {
            self.open_locked(path, Operation::ReadFile)
        })
    }

    /// Read a whole file into memory.
    pub fn read_file_bytes(&self, path: &str) -> VfsResult<Vec<u8>> {
        self.run(Operation::ReadFile, path, || {
            let mut reader = self.open_locked(path, Operation::ReadFile)?;
            let mut data = Vec::with_capacity(reader.info().length as usize);
            reader
                .read_to_end(&mut data)
                .map_err(|e| VfsError::backend("could not read file", e))?;
            Ok(data)
        })
    }

    fn open_locked(&self, path: &str, op: Operation) -> VfsResult<LockedReader<B::Reader>> {
        let file = self.prepare_read(path, op)?;
        let guard = self.lock(&file, LockKind::Read)?;
        let reader = self
            .resolver
            .backend()
            .open_read(&file.handle)
            .map_err(|e| VfsError::backend("could not open file", e))?;
        Ok(LockedReader {
            reader,
            info: file.info,
            _guard: guard,
        })
    }

    /// Write a whole file from `data`.
    ///
    /// An existing file is only replaced when `overwrite` is set. The bytes
    /// go to a staging file first, so a failed write leaves the target as it
    /// was.
    pub fn write_file(
        &self,
        path: &str,
        mut data: impl Read,
        overwrite: bool,
    ) -> VfsResult<ResourceInfo> {
        let op = Operation::WriteFile;
        self.run(op, path, || {
            let (target, existed) = self.prepare_write(path, overwrite, op)?;
            let _guard = self.lock(&target, LockKind::Write)?;
            let backend = self.resolver.backend();
            let staged = self.staging_handle(&target, &Uuid::new_v4().simple().to_string())?;

            let written = backend
                .open_write(&staged, true)
                .and_then(|mut writer| {
                    let copied = io::copy(&mut data, &mut writer)?;
                    io::Write::flush(&mut writer)?;
                    Ok(copied)
                })
                .and_then(|copied| {
                    backend.replace_file(&staged, &target.handle)?;
                    Ok(copied)
                });
            let written = match written {
                Ok(written) => written,
                Err(e) => {
                    self.discard_staged(&staged);
                    return Err(VfsError::backend("could not write file", e));
                }
            };

            let info = self.refresh(&target, op)?;
            info!(path = %info.full_name, bytes = written, replaced = existed, "File written");
            Ok(info)
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::auth::{PathRule, PermissionLevel};
    use crate::backend::MemoryBackend;
    use protocol::ErrorKind;
    use std::path::PathBuf;

    fn setup() -> (VfsGateway<MemoryBackend>, MemoryBackend, Arc<MemoryAuditSink>) {
        let backend = MemoryBackend::new();
        backend.create_dir_all("/data/a").unwrap();
        backend.put_file("/data/a/f.txt", "hello").unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        let gateway = VfsGateway::builder(backend.clone())
            .root("/data")
            .relative_paths(true)
            .audit_sink(sink.clone())
            .build()
            .unwrap();
        (gateway, backend, sink)
    }

    #[test]
    fn test_root_info() {
        let (gateway, _, _) = setup();
        let root = gateway.root().unwrap();
        assert!(root.is_root_folder);
        assert_eq!(root.full_name, "vfs:/");
    }

    #[test]
    fn test_listing_with_filter() {
        let (gateway, backend, _) = setup();
        backend.put_file("/data/a/g.log", "x").unwrap();
        backend.create_dir_all("/data/a/sub").unwrap();

        let contents = gateway.folder_contents("vfs:/a", None).unwrap();
        assert_eq!(contents.folders.len(), 1);
        assert_eq!(contents.files.len(), 2);

        let logs = gateway.child_files("vfs:/a", Some("*.log")).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].full_name, "vfs:/a/g.log");

        let err = gateway.child_files("vfs:/a", Some("[")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
    }

    #[test]
    fn test_parents() {
        let (gateway, _, _) = setup();
        assert_eq!(gateway.file_parent("vfs:/a/f.txt").unwrap().full_name, "vfs:/a");
        assert_eq!(
            gateway.folder_parent("vfs:/a").unwrap().unwrap().full_name,
            "vfs:/"
        );
        assert!(gateway.folder_parent("vfs:/").unwrap().is_none());
    }

    #[test]
    fn test_availability() {
        let (gateway, _, _) = setup();
        assert!(gateway.is_file_available("vfs:/a/f.txt").unwrap());
        assert!(!gateway.is_file_available("vfs:/a").unwrap());
        assert!(gateway.is_folder_available("vfs:/a").unwrap());
        assert!(!gateway.is_folder_available("vfs:/zzz").unwrap());
    }

    #[test]
    fn test_create_folder_rules() {
        let (gateway, _, _) = setup();
        let info = gateway.create_folder("vfs:/a", "new").unwrap();
        assert_eq!(info.full_name, "vfs:/a/new");

        let err = gateway.create_folder("vfs:/a", "new").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAlreadyExists);

        let err = gateway.create_folder("vfs:/a", "f.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAlreadyExists);

        for bad in ["", "..", "x/y"] {
            let err = gateway.create_folder("vfs:/a", bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidPath, "{bad:?}");
        }
    }

    #[test]
    fn test_machine_root_is_not_writable() {
        let backend = MemoryBackend::new();
        let gateway = VfsGateway::builder(backend).build().unwrap();
        let err = gateway.create_folder("/", "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        let err = gateway.write_file("/x.txt", &b"x"[..], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
    }

    #[test]
    fn test_root_cannot_be_deleted_even_with_full_claims() {
        let (gateway, backend, _) = setup();
        let err = gateway.delete_folder("vfs:/").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        assert!(backend.exists(Path::new("/data/a/f.txt")));
    }

    #[test]
    fn test_delete_respects_locks() {
        let (gateway, backend, _) = setup();
        let reader = gateway.read_file("vfs:/a/f.txt").unwrap();

        let err = gateway.delete_folder("vfs:/a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLocked);
        let err = gateway.delete_file("vfs:/a/f.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLocked);

        drop(reader);
        gateway.delete_folder("vfs:/a").unwrap();
        assert!(!backend.exists(Path::new("/data/a")));
    }

    #[test]
    fn test_move_and_copy_degenerate_cases() {
        let (gateway, backend, _) = setup();
        backend.create_dir_all("/data/b").unwrap();

        let err = gateway.move_folder("vfs:/a", "vfs:/a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);

        let err = gateway.copy_folder("vfs:/a", "vfs:/a/inner").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);

        let err = gateway.move_folder("vfs:/a", "vfs:/b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAlreadyExists);

        let err = gateway.move_folder("vfs:/a", "vfs:/missing/a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
        assert!(backend.exists(Path::new("/data/a/f.txt")));
    }

    #[test]
    fn test_copy_file_then_move_file() {
        let (gateway, backend, _) = setup();
        let copy = gateway.copy_file("vfs:/a/f.txt", "vfs:/f2.txt").unwrap();
        assert_eq!(copy.length, 5);
        assert!(backend.exists(Path::new("/data/a/f.txt")));

        let moved = gateway.move_file("vfs:/f2.txt", "vfs:/a/f3.txt").unwrap();
        assert_eq!(moved.full_name, "vfs:/a/f3.txt");
        assert!(!backend.exists(Path::new("/data/f2.txt")));
    }

    #[test]
    fn test_write_and_read_back() {
        let (gateway, _, _) = setup();
        let info = gateway.write_file("vfs:/a/n.bin", &b"12345678"[..], false).unwrap();
        assert_eq!(info.length, 8);
        assert_eq!(gateway.read_file_bytes("vfs:/a/n.bin").unwrap(), b"12345678");

        let err = gateway.write_file("vfs:/a", &b"x"[..], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAlreadyExists);
    }

    #[test]
    fn test_failed_overwrite_keeps_original() {
        let (gateway, backend, _) = setup();
        let failing = (&b"xy"[..]).chain(FailingReader);

        let err = gateway.write_file("vfs:/a/f.txt", failing, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        assert_eq!(backend.file_contents("/data/a/f.txt").unwrap(), b"hello");
        assert_eq!(
            backend.list_child_files(&PathBuf::from("/data/a")).unwrap(),
            vec![PathBuf::from("/data/a/f.txt")]
        );

        let info = gateway.write_file("vfs:/a/f.txt", &b"bye"[..], true).unwrap();
        assert_eq!(info.length, 3);
        assert_eq!(backend.file_contents("/data/a/f.txt").unwrap(), b"bye");
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "connection reset"))
        }
    }

    #[test]
    fn test_claims_are_enforced() {
        let backend = MemoryBackend::new();
        backend.create_dir_all("/data/ro").unwrap();
        backend.put_file("/data/ro/f.txt", "x").unwrap();
        let gateway = VfsGateway::builder(backend)
            .root("/data")
            .authorizer(
                PermissionAuthorizer::new(PermissionLevel::Full)
                    .with_rule(PathRule::new("/data/ro", PermissionLevel::Read, true)),
            )
            .build()
            .unwrap();

        assert!(gateway.folder_contents("/data/ro", None).is_ok());
        let err = gateway.delete_file("/data/ro/f.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        let err = gateway.create_folder("/data/ro", "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        let err = gateway.write_file("/data/ro/f.txt", &b"y"[..], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        let err = gateway.move_file("/data/ro/f.txt", "/data/f.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        assert!(gateway.copy_file("/data/ro/f.txt", "/data/f.txt").is_ok());
    }

    #[test]
    fn test_denied_relocation_does_not_reveal_destination() {
        let backend = MemoryBackend::new();
        backend.create_dir_all("/data/ro").unwrap();
        backend.create_dir_all("/data/rw").unwrap();
        backend.put_file("/data/ro/f.txt", "x").unwrap();
        backend.put_file("/data/ro/taken.txt", "y").unwrap();
        backend.put_file("/data/rw/g.txt", "z").unwrap();
        let gateway = VfsGateway::builder(backend.clone())
            .root("/data")
            .authorizer(
                PermissionAuthorizer::new(PermissionLevel::Full)
                    .with_rule(PathRule::new("/data/ro", PermissionLevel::Read, true)),
            )
            .build()
            .unwrap();

        // Adding to a read-only folder is denied whether or not the name is taken.
        for destination in ["/data/ro/taken.txt", "/data/ro/free.txt"] {
            let err = gateway.copy_file("/data/rw/g.txt", destination).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied, "{destination}");
        }
        // Moving a read-only source is denied before the destination is examined.
        let err = gateway.move_file("/data/ro/f.txt", "/data/rw/g.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        let err = gateway.move_file("/data/ro/f.txt", "/data/ro/f.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);

        let err = gateway.copy_file("/data/ro/f.txt", "/data/rw/g.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAlreadyExists);
        assert_eq!(backend.file_contents("/data/rw/g.txt").unwrap(), b"z");
    }

    #[test]
    fn test_every_operation_is_audited_once() {
        let (gateway, _, sink) = setup();
        gateway.file_info("vfs:/a/f.txt").unwrap();
        gateway.file_info("vfs:/a/missing.txt").unwrap_err();
        gateway.read_file_bytes("vfs:/a/f.txt").unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(events[0].is_success());
        assert!(!events[1].is_success());
        assert_eq!(events[2].operation, Operation::ReadFile);
    }
}
