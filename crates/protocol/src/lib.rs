//! # VFS Gateway Protocol Library
//!
//! Data model shared between the gateway engine and the transport layers
//! that expose it (RPC, REST, command line).
//!
//! ## Overview
//!
//! - **Resources**: [`ResourceInfo`] describes a file or folder by its
//!   client-visible path, never by its backend location.
//! - **Transfers**: [`TransferToken`] and [`DataBlock`] carry resumable,
//!   block-wise uploads and downloads.
//! - **Errors**: [`VfsError`] tags every failure with an [`ErrorKind`] so
//!   transports can map them to status codes without inspecting messages.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{TransmissionCapability, VfsError, ErrorKind};
//!
//! let cap = TransmissionCapability::StrictSequential;
//! assert!(cap.permits(Some(0), 1));
//! assert!(!cap.permits(Some(0), 2));
//!
//! let err = VfsError::not_found("file not found: vfs:/a.txt");
//! assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
//! ```
//!
//! ## Modules
//!
//! - [`resources`]: File and folder descriptions
//! - [`transfer`]: Transfer tokens, statuses and data blocks
//! - [`error`]: Error taxonomy

pub mod error;
pub mod resources;
pub mod transfer;

pub use error::{ErrorKind, VfsError, VfsResult};
pub use resources::{FolderContents, ResourceInfo, ResourceKind};
pub use transfer::{
    block_count, DataBlock, TransferDirection, TransferStatus, TransferToken,
    TransmissionCapability,
};
