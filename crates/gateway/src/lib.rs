//! # VFS Gateway Library
//!
//! A uniform, sandboxed view over a storage backend, with hierarchical
//! locking and resumable block-wise transfers.
//!
//! ## Overview
//!
//! - **Path handling**: normalization, the `vfs:/` relative namespace and
//!   sandbox containment checks
//! - **Chain locking**: reader-writer locks over a resource and all of its
//!   ancestors, acquired all-or-nothing
//! - **Operations**: metadata, listing, create, delete, move, copy, and
//!   whole-file read/write, each authorized, locked and audited
//! - **Transfers**: token-based chunked downloads and uploads that can be
//!   paused, resumed and verified with SHA-256
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │        DownloadTransfers / UploadTransfers             │
//! ├────────────────────────────────────────────────────────┤
//! │                     VfsGateway                         │
//! │  ┌──────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ Resolver │  │ Chain locks  │  │ Authorization /  │  │
//! │  │ + sandbox│  │              │  │ Audit            │  │
//! │  └──────────┘  └──────────────┘  └──────────────────┘  │
//! ├────────────────────────────────────────────────────────┤
//! │           BackendAdapter (local disk, memory)          │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway::{LocalBackend, VfsGateway};
//!
//! fn main() -> anyhow::Result<()> {
//!     let gateway = VfsGateway::builder(LocalBackend)
//!         .root("/srv/files")
//!         .relative_paths(true)
//!         .build()?;
//!
//!     for folder in gateway.child_folders("vfs:/", None)? {
//!         println!("{}", folder.full_name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`paths`]: normalization, sandboxing and resolution
//! - [`locking`]: lock registry and chain locks
//! - [`backend`]: storage adapters
//! - [`auth`]: authorization providers and claims
//! - [`audit`]: audit sinks
//! - [`gateway`]: the operation orchestrator
//! - [`transfer`]: download and upload engines
//! - [`config`]: configuration loading and defaults

pub mod audit;
pub mod auth;
pub mod backend;
pub mod config;
pub mod gateway;
pub mod locking;
pub mod paths;
pub mod transfer;

// Re-export protocol for convenience
pub use protocol;

pub use audit::{AuditEvent, AuditOutcome, AuditSink, MemoryAuditSink, Operation, TracingAuditSink};
pub use auth::{
    AccessTarget, AllowAll, AuthorizationProvider, FileClaims, FolderClaims, PathRule,
    PermissionAuthorizer, PermissionLevel,
};
pub use backend::{BackendAdapter, LocalBackend, MemoryBackend, NativeMetadata};
pub use config::{Config, ConfigError};
pub use gateway::{GatewayBuilder, LockedReader, VfsGateway};
pub use locking::{ChainLockGuard, ChainLockManager, LockKind, LockRegistry};
pub use paths::{ResourceItem, Resolver, RootConfig, RELATIVE_ROOT};
pub use transfer::{
    spawn_expiry_sweeper, DownloadTransfers, InMemoryTransferStore, TransferHandler,
    TransferSettings, TransferStore, UploadTransfers,
};
