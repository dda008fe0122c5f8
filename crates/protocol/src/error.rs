//! Error taxonomy shared by the gateway engine and transport layers.
//!
//! Every failure surfaced to a caller is a [`VfsError`] tagged with one of the
//! [`ErrorKind`] variants. Backend-native failures never cross this boundary:
//! they are re-wrapped as [`ErrorKind::ResourceAccessDenied`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of failure reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unresolvable path string.
    InvalidPath,
    /// The resource is absent although existence was required.
    ResourceNotFound,
    /// Sandbox violation, claim denial or a protected location.
    ResourceAccessDenied,
    /// The target is already taken and may not be replaced.
    ResourceAlreadyExists,
    /// A chain lock could not be acquired.
    ResourceLocked,
    /// The transfer is not in a state compatible with the request.
    TransferStatusInvalid,
    /// Block number or offset violates ordering or resource bounds.
    DataBlockSequencingError,
    /// Hash of the uploaded data does not match the expected value.
    IntegrityCheckFailed,
    /// No transfer is registered under the given id.
    UnknownTransfer,
}

impl ErrorKind {
    /// Stable snake_case name, used in logs and audit events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPath => "invalid_path",
            Self::ResourceNotFound => "resource_not_found",
            Self::ResourceAccessDenied => "resource_access_denied",
            Self::ResourceAlreadyExists => "resource_already_exists",
            Self::ResourceLocked => "resource_locked",
            Self::TransferStatusInvalid => "transfer_status_invalid",
            Self::DataBlockSequencingError => "data_block_sequencing_error",
            Self::IntegrityCheckFailed => "integrity_check_failed",
            Self::UnknownTransfer => "unknown_transfer",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway error.
///
/// The message is safe to show to remote clients: it only ever contains
/// client-visible paths. The `audited` flag records whether the failure has
/// already been reported to the audit sink, so that errors bubbling through
/// nested operations are reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct VfsError {
    kind: ErrorKind,
    message: String,
    #[serde(skip)]
    audited: bool,
}

impl VfsError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            audited: false,
        }
    }

    /// Create an `InvalidPath` error.
    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    /// Create a `ResourceNotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceNotFound, message)
    }

    /// Create a `ResourceAccessDenied` error.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceAccessDenied, message)
    }

    /// Create a `ResourceAlreadyExists` error.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceAlreadyExists, message)
    }

    /// Create a `ResourceLocked` error.
    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLocked, message)
    }

    /// Create a `TransferStatusInvalid` error.
    pub fn transfer_status_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransferStatusInvalid, message)
    }

    /// Create a `DataBlockSequencingError` error.
    pub fn block_sequencing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataBlockSequencingError, message)
    }

    /// Create an `IntegrityCheckFailed` error.
    pub fn integrity_check_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IntegrityCheckFailed, message)
    }

    /// Create an `UnknownTransfer` error.
    pub fn unknown_transfer(transfer_id: &str) -> Self {
        Self::new(
            ErrorKind::UnknownTransfer,
            format!("unknown transfer: {transfer_id}"),
        )
    }

    /// Wrap a backend I/O failure.
    ///
    /// Only the I/O error kind is kept; the native message may carry
    /// absolute paths and is dropped.
    pub fn backend(context: &str, err: std::io::Error) -> Self {
        Self::access_denied(format!("{context} ({})", err.kind()))
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The client-safe message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure was already reported to the audit sink.
    pub fn is_audited(&self) -> bool {
        self.audited
    }

    /// Mark the error as reported to the audit sink.
    pub fn into_audited(mut self) -> Self {
        self.audited = true;
        self
    }
}

/// Result type alias for gateway operations.
pub type VfsResult<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_kind() {
        let err = VfsError::not_found("file not found: vfs:/a.txt");
        assert_eq!(
            err.to_string(),
            "resource_not_found: file not found: vfs:/a.txt"
        );
    }

    #[test]
    fn test_backend_error_drops_native_message() {
        let io = std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "/srv/secret/location is not writable",
        );
        let err = VfsError::backend("could not create folder", io);

        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        assert!(!err.message().contains("/srv/secret"));
        assert!(err.message().starts_with("could not create folder"));
    }

    #[test]
    fn test_audited_flag() {
        let err = VfsError::locked("resource is locked");
        assert!(!err.is_audited());

        let err = err.into_audited();
        assert!(err.is_audited());
        assert_eq!(err.kind(), ErrorKind::ResourceLocked);
    }

    #[test]
    fn test_audited_flag_not_serialized() {
        let err = VfsError::unknown_transfer("abc").into_audited();
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("audited"));

        let decoded: VfsError = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.kind(), ErrorKind::UnknownTransfer);
        assert!(!decoded.is_audited());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::InvalidPath.to_string(), "invalid_path");
        assert_eq!(
            ErrorKind::DataBlockSequencingError.as_str(),
            "data_block_sequencing_error"
        );
        let json = serde_json::to_string(&ErrorKind::IntegrityCheckFailed).unwrap();
        assert_eq!(json, "\"integrity_check_failed\"");
    }
}
