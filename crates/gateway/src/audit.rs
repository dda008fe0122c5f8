//! Audit events.
//!
//! Every gateway operation reports its outcome exactly once. Sinks are
//! fire-and-forget: they cannot fail or influence the operation.

use std::fmt;
use std::sync::Mutex;

use protocol::{ErrorKind, VfsResult};
use serde::Serialize;
use tracing::info;

use crate::backend::now_secs;

/// Operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    RootInfo,
    FileInfo,
    FolderInfo,
    FileParent,
    FolderParent,
    ListFolders,
    ListFiles,
    FolderContents,
    CheckAvailability,
    CreateFolder,
    DeleteFolder,
    DeleteFile,
    MoveFolder,
    MoveFile,
    CopyFolder,
    CopyFile,
    ReadFile,
    WriteFile,
    RequestDownload,
    ReadBlock,
    RequestUpload,
    WriteBlock,
    TransferStatus,
    ReloadToken,
    PauseTransfer,
    CompleteTransfer,
    CancelTransfer,
}

impl Operation {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootInfo => "root_info",
            Self::FileInfo => "file_info",
            Self::FolderInfo => "folder_info",
            Self::FileParent => "file_parent",
            Self::FolderParent => "folder_parent",
            Self::ListFolders => "list_folders",
            Self::ListFiles => "list_files",
            Self::FolderContents => "folder_contents",
            Self::CheckAvailability => "check_availability",
            Self::CreateFolder => "create_folder",
            Self::DeleteFolder => "delete_folder",
            Self::DeleteFile => "delete_file",
            Self::MoveFolder => "move_folder",
            Self::MoveFile => "move_file",
            Self::CopyFolder => "copy_folder",
            Self::CopyFile => "copy_file",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::RequestDownload => "request_download",
            Self::ReadBlock => "read_block",
            Self::RequestUpload => "request_upload",
            Self::WriteBlock => "write_block",
            Self::TransferStatus => "transfer_status",
            Self::ReloadToken => "reload_token",
            Self::PauseTransfer => "pause_transfer",
            Self::CompleteTransfer => "complete_transfer",
            Self::CancelTransfer => "cancel_transfer",
        }
    }

    /// Returns true if the operation changes backend state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateFolder
                | Self::DeleteFolder
                | Self::DeleteFile
                | Self::MoveFolder
                | Self::MoveFile
                | Self::CopyFolder
                | Self::CopyFile
                | Self::WriteFile
                | Self::RequestUpload
                | Self::WriteBlock
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { kind: ErrorKind, message: String },
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub operation: Operation,
    /// Client-visible path or transfer id.
    pub resource: String,
    pub outcome: AuditOutcome,
    /// Unix seconds.
    pub timestamp: u64,
}

impl AuditEvent {
    /// Creates an event stamped with the current time.
    pub fn new(operation: Operation, resource: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            operation,
            resource: resource.into(),
            outcome,
            timestamp: now_secs(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AuditOutcome::Success
    }
}

/// Receiver of audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits audit events as `tracing` events on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match &event.outcome {
            AuditOutcome::Success => info!(
                target: "audit",
                operation = %event.operation,
                resource = %event.resource,
                "success"
            ),
            AuditOutcome::Failure { kind, message } => info!(
                target: "audit",
                operation = %event.operation,
                resource = %event.resource,
                error_kind = %kind,
                error = %message,
                "failure"
            ),
        }
    }
}

/// Collects events in memory. Mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Recorded events for one operation.
    pub fn events_for(&self, operation: Operation) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.operation == operation)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Report `result` to `sink` and pass it through.
///
/// Errors that were already reported further down the call chain are passed
/// through untouched; all others are reported and marked as audited.
pub(crate) fn audit<T>(
    sink: &dyn AuditSink,
    operation: Operation,
    resource: &str,
    result: VfsResult<T>,
) -> VfsResult<T> {
    match result {
        Ok(value) => {
            sink.record(AuditEvent::new(operation, resource, AuditOutcome::Success));
            Ok(value)
        }
        Err(err) if err.is_audited() => Err(err),
        Err(err) => {
            sink.record(AuditEvent::new(
                operation,
                resource,
                AuditOutcome::Failure {
                    kind: err.kind(),
                    message: err.message().to_string(),
                },
            ));
            Err(err.into_audited())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::VfsError;

    #[test]
    fn test_success_is_recorded() {
        let sink = MemoryAuditSink::new();
        let value = audit(&sink, Operation::FileInfo, "vfs:/a.txt", Ok(7)).unwrap();
        assert_eq!(value, 7);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_success());
        assert_eq!(events[0].resource, "vfs:/a.txt");
    }

    #[test]
    fn test_failure_is_recorded_once() {
        let sink = MemoryAuditSink::new();
        let inner: VfsResult<()> = Err(VfsError::not_found("file not found: vfs:/a.txt"));

        let err = audit(&sink, Operation::ReadFile, "vfs:/a.txt", inner).unwrap_err();
        assert!(err.is_audited());

        let again = audit(&sink, Operation::CopyFile, "vfs:/a.txt", Err::<(), _>(err)).unwrap_err();
        assert_eq!(again.kind(), ErrorKind::ResourceNotFound);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::ReadFile);
        assert_eq!(
            events[0].outcome,
            AuditOutcome::Failure {
                kind: ErrorKind::ResourceNotFound,
                message: "file not found: vfs:/a.txt".to_string(),
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = AuditEvent::new(
            Operation::DeleteFolder,
            "vfs:/a",
            AuditOutcome::Failure {
                kind: ErrorKind::ResourceLocked,
                message: "locked".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operation"], "delete_folder");
        assert_eq!(json["outcome"]["status"], "failure");
        assert_eq!(json["outcome"]["kind"], "resource_locked");
    }
}
