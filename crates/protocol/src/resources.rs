//! File and folder descriptions handed out to clients.

use serde::{Deserialize, Serialize};

/// Whether a resource is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Regular file.
    File,
    /// Folder (directory).
    Folder,
}

impl ResourceKind {
    /// Lowercase name for messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }
}

/// Description of a file or folder as seen by a client.
///
/// `full_name` is the client-visible path. When the gateway runs in
/// relative-path mode it is root-relative (`vfs:/...`) and never discloses
/// the backend location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Client-visible path of the resource.
    pub full_name: String,
    /// Last path component (empty for the root folder).
    pub name: String,
    /// Client-visible path of the parent folder, `None` for the root.
    pub parent_folder_path: Option<String>,
    /// File or folder.
    pub kind: ResourceKind,
    /// Whether this is the root folder of the gateway.
    pub is_root_folder: bool,
    /// Size in bytes (0 for folders).
    pub length: u64,
    /// Content type derived from the file extension (files only).
    pub content_type: Option<String>,
    /// Creation timestamp (Unix epoch seconds, 0 if unknown).
    pub created: u64,
    /// Last modified timestamp (Unix epoch seconds, 0 if unknown).
    pub modified: u64,
    /// Whether the backend reports the resource as read-only.
    pub read_only: bool,
}

impl ResourceInfo {
    /// Returns true if this describes a file.
    pub fn is_file(&self) -> bool {
        self.kind == ResourceKind::File
    }

    /// Returns true if this describes a folder.
    pub fn is_folder(&self) -> bool {
        self.kind == ResourceKind::Folder
    }
}

/// A folder together with its immediate children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderContents {
    /// The listed folder.
    pub folder: ResourceInfo,
    /// Child folders, sorted by name.
    pub folders: Vec<ResourceInfo>,
    /// Child files, sorted by name.
    pub files: Vec<ResourceInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> ResourceInfo {
        ResourceInfo {
            full_name: "vfs:/docs/report.txt".to_string(),
            name: "report.txt".to_string(),
            parent_folder_path: Some("vfs:/docs".to_string()),
            kind: ResourceKind::File,
            is_root_folder: false,
            length: 1024,
            content_type: Some("text/plain".to_string()),
            created: 1704067200,
            modified: 1704067200,
            read_only: false,
        }
    }

    #[test]
    fn test_kind_helpers() {
        let info = sample_file();
        assert!(info.is_file());
        assert!(!info.is_folder());
        assert_eq!(info.kind.as_str(), "file");
    }

    #[test]
    fn test_resource_info_json_shape() {
        let json = serde_json::to_value(sample_file()).unwrap();
        assert_eq!(json["kind"], "file");
        assert_eq!(json["full_name"], "vfs:/docs/report.txt");
        assert_eq!(json["parent_folder_path"], "vfs:/docs");
    }
}
