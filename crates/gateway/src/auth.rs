//! Authorization hooks.
//!
//! The gateway never computes policy. It asks an [`AuthorizationProvider`]
//! whether a location may be reached at all, and which actions are allowed
//! on a resolved folder or file, then branches on the returned booleans.

use std::path::{Path, PathBuf};

use protocol::ResourceInfo;
use serde::{Deserialize, Serialize};

use crate::audit::Operation;
use crate::paths::normalize::normalize;

/// A resolved resource presented for an authorization decision.
#[derive(Debug, Clone, Copy)]
pub struct AccessTarget<'a> {
    /// Client-visible description.
    pub info: &'a ResourceInfo,
    /// Located backend path.
    pub native_path: &'a Path,
    /// Operation being performed.
    pub operation: Operation,
}

/// Actions permitted on a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FolderClaims {
    pub allow_list_contents: bool,
    pub allow_add_files: bool,
    pub allow_add_folders: bool,
    pub allow_delete: bool,
}

impl FolderClaims {
    /// Every action permitted.
    pub fn all() -> Self {
        Self {
            allow_list_contents: true,
            allow_add_files: true,
            allow_add_folders: true,
            allow_delete: true,
        }
    }
}

/// Actions permitted on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileClaims {
    pub allow_read_data: bool,
    pub allow_overwrite: bool,
    pub allow_delete: bool,
}

impl FileClaims {
    /// Every action permitted.
    pub fn all() -> Self {
        Self {
            allow_read_data: true,
            allow_overwrite: true,
            allow_delete: true,
        }
    }
}

/// Policy decisions consumed by the gateway.
pub trait AuthorizationProvider: Send + Sync {
    /// Whether the client may reach this location at all.
    fn authorize_location(&self, target: &AccessTarget<'_>) -> bool;

    /// Actions permitted on a folder.
    fn folder_claims(&self, target: &AccessTarget<'_>) -> FolderClaims;

    /// Actions permitted on a file.
    fn file_claims(&self, target: &AccessTarget<'_>) -> FileClaims;
}

/// Grants everything. The sandbox root still applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationProvider for AllowAll {
    fn authorize_location(&self, _target: &AccessTarget<'_>) -> bool {
        true
    }

    fn folder_claims(&self, _target: &AccessTarget<'_>) -> FolderClaims {
        FolderClaims::all()
    }

    fn file_claims(&self, _target: &AccessTarget<'_>) -> FileClaims {
        FileClaims::all()
    }
}

/// Permission level for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// No access.
    #[default]
    None,
    /// List folders, read files.
    Read,
    /// Also add and overwrite files.
    ReadWrite,
    /// Also create folders and delete anything.
    Full,
}

impl PermissionLevel {
    pub fn can_read(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite | Self::Full)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Self::ReadWrite | Self::Full)
    }

    pub fn can_delete(&self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Permission for a path, optionally covering everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub path: PathBuf,
    pub level: PermissionLevel,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

impl PathRule {
    pub fn new(path: impl Into<PathBuf>, level: PermissionLevel, recursive: bool) -> Self {
        Self {
            path: path.into(),
            level,
            recursive,
        }
    }

    fn matches(&self, path: &Path) -> bool {
        let rule_path = normalize(&self.path);
        if self.recursive {
            path.starts_with(&rule_path)
        } else {
            path == rule_path
        }
    }
}

/// Rule-based provider: the most specific matching rule wins, otherwise the
/// default level applies.
///
/// Rules match the located backend path, so they should name real
/// (symlink-free) locations.
#[derive(Debug, Clone, Default)]
pub struct PermissionAuthorizer {
    rules: Vec<PathRule>,
    default_level: PermissionLevel,
}

impl PermissionAuthorizer {
    pub fn new(default_level: PermissionLevel) -> Self {
        Self {
            rules: Vec::new(),
            default_level,
        }
    }

    /// Add a rule.
    pub fn with_rule(mut self, rule: PathRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add several rules.
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = PathRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Effective level for a backend path.
    pub fn level_for(&self, path: &Path) -> PermissionLevel {
        let path = normalize(path);
        self.rules
            .iter()
            .filter(|rule| rule.matches(&path))
            .max_by_key(|rule| normalize(&rule.path).components().count())
            .map_or(self.default_level, |rule| rule.level)
    }
}

impl AuthorizationProvider for PermissionAuthorizer {
    fn authorize_location(&self, target: &AccessTarget<'_>) -> bool {
        self.level_for(target.native_path) != PermissionLevel::None
    }

    fn folder_claims(&self, target: &AccessTarget<'_>) -> FolderClaims {
        let level = self.level_for(target.native_path);
        FolderClaims {
            allow_list_contents: level.can_read(),
            allow_add_files: level.can_write(),
            allow_add_folders: level.can_delete(),
            allow_delete: level.can_delete(),
        }
    }

    fn file_claims(&self, target: &AccessTarget<'_>) -> FileClaims {
        let level = self.level_for(target.native_path);
        FileClaims {
            allow_read_data: level.can_read(),
            allow_overwrite: level.can_write(),
            allow_delete: level.can_delete(),
        }
    }
}
