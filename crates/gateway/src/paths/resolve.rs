//! Resolution pipeline: client path to validated [`ResourceItem`].
//!
//! Order of checks is fixed: normalize, detect the root, locate through the
//! backend and verify containment, rewrite to the client-visible form,
//! authorize the location, then enforce existence. Claims for a specific
//! action are checked afterwards by the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::{ResourceInfo, ResourceKind, VfsError, VfsResult};
use tracing::{debug, warn};

use super::normalize::{
    lock_ancestors, machine_root, normalize, qualified_id, to_absolute, to_relative,
};
use super::sandbox::is_contained_in;
use crate::audit::Operation;
use crate::auth::{AccessTarget, AuthorizationProvider, FileClaims, FolderClaims};
use crate::backend::{content_type_for, BackendAdapter, NativeMetadata};

/// Sandbox root and client path mode. Fixed for the lifetime of a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootConfig {
    root: Option<PathBuf>,
    relative_paths: bool,
}

impl RootConfig {
    /// Whole backend namespace, absolute client paths.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Confine the gateway to `root`.
    pub fn sandboxed(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            relative_paths: false,
        }
    }

    /// Report paths to clients in root-relative form (`vfs:/...`).
    pub fn relative_paths(mut self, enabled: bool) -> Self {
        self.relative_paths = enabled;
        self
    }

    /// Configured root, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn uses_relative_paths(&self) -> bool {
        self.relative_paths
    }

    /// The configured root, or the machine root.
    pub fn effective_root(&self) -> PathBuf {
        self.root.as_deref().map_or_else(machine_root, normalize)
    }

    fn validate(&self) -> VfsResult<()> {
        if let Some(root) = &self.root {
            if !root.is_absolute() {
                return Err(VfsError::invalid_path("root must be an absolute path"));
            }
        } else if self.relative_paths {
            return Err(VfsError::invalid_path(
                "relative paths require a configured root",
            ));
        }
        Ok(())
    }
}

/// A resolved file or folder.
///
/// Built fresh for every request and never cached: existence and metadata
/// reflect the backend at resolution time.
#[derive(Debug, Clone)]
pub struct ResourceItem<H> {
    /// Client-visible description.
    pub info: ResourceInfo,
    /// Identity for locking and auditing.
    pub qualified_id: String,
    /// Qualified ids of the ancestors below the root, root-most first.
    pub ancestor_ids: Vec<String>,
    /// Lexically normalized absolute path.
    pub native_path: PathBuf,
    /// Backend handle.
    pub handle: H,
    /// Whether this is the gateway root.
    pub is_root: bool,
    present: Option<ResourceKind>,
}

impl<H> ResourceItem<H> {
    /// An entry of the requested kind exists.
    pub fn exists(&self) -> bool {
        self.present == Some(self.info.kind)
    }

    /// Any entry exists at this location, whatever its kind.
    pub fn is_occupied(&self) -> bool {
        self.present.is_some()
    }

    pub fn kind(&self) -> ResourceKind {
        self.info.kind
    }

    /// Client-visible path.
    pub fn name(&self) -> &str {
        &self.info.full_name
    }
}

/// Turns client paths into [`ResourceItem`]s.
pub struct Resolver<B: BackendAdapter> {
    backend: Arc<B>,
    config: RootConfig,
    root: PathBuf,
    located_root: PathBuf,
    auth: Arc<dyn AuthorizationProvider>,
}

impl<B: BackendAdapter> std::fmt::Debug for Resolver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .field("located_root", &self.located_root)
            .finish_non_exhaustive()
    }
}

impl<B: BackendAdapter> Resolver<B> {
    /// Creates a resolver. Fails if the root configuration is inconsistent
    /// or the backend cannot locate the root.
    pub fn new(
        backend: Arc<B>,
        config: RootConfig,
        auth: Arc<dyn AuthorizationProvider>,
    ) -> VfsResult<Self> {
        config.validate()?;
        let root = config.effective_root();
        let located_root = backend
            .locate(&root)
            .map_err(|e| VfsError::backend("could not locate root", e))?
            .as_ref()
            .to_path_buf();

        Ok(Self {
            backend,
            config,
            root,
            located_root,
            auth,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &RootConfig {
        &self.config
    }

    pub fn auth(&self) -> &dyn AuthorizationProvider {
        self.auth.as_ref()
    }

    /// Normalized root path (configured or machine root).
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Whether `path` denotes the gateway root.
    pub fn is_root(&self, path: &Path) -> bool {
        qualified_id(path) == qualified_id(&self.root)
    }

    /// Client-visible form of an absolute path.
    pub fn client_name(&self, path: &Path) -> String {
        if self.config.relative_paths {
            to_relative(path, Some(&self.root)).unwrap_or_else(|_| "<outside root>".to_string())
        } else {
            path.to_string_lossy().into_owned()
        }
    }

    /// Resolve a client-submitted path.
    pub fn resolve(
        &self,
        path: &str,
        kind: ResourceKind,
        must_exist: bool,
        operation: Operation,
    ) -> VfsResult<ResourceItem<B::Handle>> {
        let absolute = to_absolute(path, self.config.root())?;
        self.resolve_native(&absolute, kind, must_exist, operation)
    }

    /// Resolve an absolute path, e.g. a child path produced by a listing.
    pub fn resolve_native(
        &self,
        path: &Path,
        kind: ResourceKind,
        must_exist: bool,
        operation: Operation,
    ) -> VfsResult<ResourceItem<B::Handle>> {
        let absolute = normalize(path);
        if !is_contained_in(&self.root, &absolute) {
            warn!(path = %absolute.display(), %operation, "Path outside sandbox root");
            return Err(self.denied(&absolute));
        }

        let is_root = self.is_root(&absolute);
        let handle = self.locate(&absolute)?;
        let metadata = self
            .backend
            .metadata(&handle)
            .map_err(|e| VfsError::backend("could not read metadata", e))?;

        let item = if is_root {
            self.root_item(handle, metadata, kind)
        } else {
            self.build_item(&absolute, handle, metadata, kind)
        };

        let target = AccessTarget {
            info: &item.info,
            native_path: item.handle.as_ref(),
            operation,
        };
        if !self.auth.authorize_location(&target) {
            debug!(path = %item.info.full_name, %operation, "Location not authorized");
            return Err(VfsError::access_denied(format!(
                "access denied: {}",
                item.info.full_name
            )));
        }

        if must_exist && !item.exists() {
            return Err(VfsError::not_found(format!(
                "{} not found: {}",
                kind.as_str(),
                item.info.full_name
            )));
        }

        debug!(
            path = %item.info.full_name,
            %operation,
            exists = item.exists(),
            "Resolved resource"
        );
        Ok(item)
    }

    /// Claims for a resolved folder.
    pub fn folder_claims(&self, item: &ResourceItem<B::Handle>, operation: Operation) -> FolderClaims {
        self.auth.folder_claims(&AccessTarget {
            info: &item.info,
            native_path: item.handle.as_ref(),
            operation,
        })
    }

    /// Claims for a resolved file.
    pub fn file_claims(&self, item: &ResourceItem<B::Handle>, operation: Operation) -> FileClaims {
        self.auth.file_claims(&AccessTarget {
            info: &item.info,
            native_path: item.handle.as_ref(),
            operation,
        })
    }

    fn denied(&self, path: &Path) -> VfsError {
        if self.config.relative_paths {
            VfsError::access_denied("access denied: path lies outside the root")
        } else {
            VfsError::access_denied(format!("access denied: {}", path.display()))
        }
    }

    /// Locate through the backend and re-check containment on the result.
    fn locate(&self, absolute: &Path) -> VfsResult<B::Handle> {
        let handle = match self.backend.locate(absolute) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(path = %absolute.display(), error = %e, "Could not locate path, treating as outside root");
                return Err(self.denied(absolute));
            }
        };

        if !is_contained_in(&self.located_root, handle.as_ref()) {
            warn!(
                path = %absolute.display(),
                located = %handle.as_ref().display(),
                "Located path escapes sandbox root"
            );
            return Err(self.denied(absolute));
        }
        Ok(handle)
    }

    fn root_item(
        &self,
        handle: B::Handle,
        metadata: Option<NativeMetadata>,
        kind: ResourceKind,
    ) -> ResourceItem<B::Handle> {
        let (created, modified, read_only) = metadata
            .as_ref()
            .map_or((0, 0, false), |m| (m.created, m.modified, m.read_only));

        ResourceItem {
            info: ResourceInfo {
                full_name: self.client_name(&self.root),
                name: String::new(),
                parent_folder_path: None,
                kind,
                is_root_folder: true,
                length: 0,
                content_type: None,
                created,
                modified,
                read_only,
            },
            qualified_id: qualified_id(handle.as_ref()),
            ancestor_ids: Vec::new(),
            native_path: self.root.clone(),
            handle,
            is_root: true,
            // The root always exists, as a folder.
            present: Some(ResourceKind::Folder),
        }
    }

    fn build_item(
        &self,
        absolute: &Path,
        handle: B::Handle,
        metadata: Option<NativeMetadata>,
        kind: ResourceKind,
    ) -> ResourceItem<B::Handle> {
        let name = absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent_folder_path = absolute.parent().map(|p| self.client_name(p));

        let matching = metadata.as_ref().filter(|m| m.kind == kind);
        let info = ResourceInfo {
            full_name: self.client_name(absolute),
            content_type: (kind == ResourceKind::File).then(|| content_type_for(&name).to_string()),
            name,
            parent_folder_path,
            kind,
            is_root_folder: false,
            length: matching.map_or(0, |m| m.length),
            created: matching.map_or(0, |m| m.created),
            modified: matching.map_or(0, |m| m.modified),
            read_only: matching.is_some_and(|m| m.read_only),
        };

        ResourceItem {
            info,
            qualified_id: qualified_id(handle.as_ref()),
            ancestor_ids: lock_ancestors(&self.located_root, handle.as_ref()),
            native_path: absolute.to_path_buf(),
            handle,
            is_root: false,
            present: metadata.map(|m| m.kind),
        }
    }
}
