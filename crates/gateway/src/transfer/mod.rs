//! Resumable chunked transfers.
//!
//! A transfer is a server-side session identified by a token. Requesting a
//! token resolves the resource and takes a chain lock that the session holds
//! until it completes or is cancelled: a read lock for downloads, a write
//! lock for uploads. Blocks then move through the session one at a time.
//!
//! Pausing closes the backend stream but keeps the lock and the token; the
//! next block call re-opens the stream and seeks to the block offset.

pub mod download;
pub mod store;
pub mod sweeper;
pub mod upload;

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use protocol::{TransferStatus, TransferToken, TransmissionCapability, VfsError, VfsResult};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::locking::ChainLockGuard;

pub use download::DownloadTransfers;
pub use store::{InMemoryTransferStore, TransferStore};
pub use sweeper::{spawn_expiry_sweeper, sweep_expired};
pub use upload::UploadTransfers;

/// Default block size (64KB).
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Maximum block size (1MB).
pub const MAX_BLOCK_SIZE: u64 = 1024 * 1024;

/// Default upload size limit (100MB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Limits and defaults shared by both transfer directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    /// Block size used when the client does not ask for one.
    pub default_block_size: u64,
    /// Upper bound for any block.
    pub max_block_size: u64,
    /// Largest resource an upload may announce.
    pub max_file_size: u64,
    /// Advisory token lifetime; `None` means tokens never expire.
    pub token_ttl: Option<Duration>,
    /// Block ordering accepted by this gateway.
    pub capability: TransmissionCapability,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_block_size: DEFAULT_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            token_ttl: Some(Duration::from_secs(3600)),
            capability: TransmissionCapability::Random,
        }
    }
}

impl TransferSettings {
    /// Block size for a new session.
    pub fn block_size(&self, requested: Option<u64>) -> u64 {
        requested
            .filter(|size| *size > 0)
            .unwrap_or(self.default_block_size)
            .min(self.max_block_size)
            .max(1)
    }

    /// Expiration timestamp for a token created at `now`.
    pub fn expiration(&self, now: u64) -> Option<u64> {
        self.token_ttl.map(|ttl| now.saturating_add(ttl.as_secs()))
    }
}

/// Lifecycle operations common to downloads and uploads.
pub trait TransferHandler: Send + Sync {
    /// Current status of a transfer.
    fn transfer_status(&self, transfer_id: &str) -> VfsResult<TransferStatus>;

    /// Current token, e.g. to resume after a client restart.
    fn reload_token(&self, transfer_id: &str) -> VfsResult<TransferToken>;

    /// Close the backend stream, keeping the lock and the token.
    fn pause_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken>;

    /// Finish the transfer and release its lock.
    fn complete_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken>;

    /// Abort the transfer and release its lock.
    fn cancel_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken>;

    fn max_block_size(&self) -> u64;

    fn transmission_capability(&self) -> TransmissionCapability;

    fn max_file_size(&self) -> u64;

    /// Ids of active transfers whose advisory expiration lies before `now`.
    fn expired_transfers(&self, now: u64) -> Vec<String>;
}

/// State of one transfer as kept in a [`TransferStore`].
///
/// `S` is the open backend stream, if any. The chain lock guard lives here
/// so the lock is released exactly when the session is dropped.
#[derive(Debug)]
pub struct TransferSession<H, S> {
    pub(crate) token: TransferToken,
    pub(crate) handle: H,
    pub(crate) stream: Option<S>,
    pub(crate) guard: Option<ChainLockGuard>,
    /// Client-visible resource path.
    pub(crate) resource: String,
    /// Sibling file that receives upload blocks until completion.
    pub(crate) staging: Option<H>,
}

impl<H, S> TransferSession<H, S> {
    /// Token as last updated.
    pub fn token(&self) -> &TransferToken {
        &self.token
    }

    /// Client-visible path of the transferred resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether the session still holds its chain lock.
    pub fn holds_lock(&self) -> bool {
        self.guard.as_ref().is_some_and(ChainLockGuard::is_enabled)
    }
}

pub(crate) type SharedSession<H, S> = Arc<Mutex<TransferSession<H, S>>>;

pub(crate) fn fetch<H, S>(
    store: &dyn TransferStore<TransferSession<H, S>>,
    transfer_id: &str,
) -> VfsResult<SharedSession<H, S>> {
    store
        .get(transfer_id)
        .ok_or_else(|| VfsError::unknown_transfer(transfer_id))
}

pub(crate) fn lock_session<H, S>(
    session: &SharedSession<H, S>,
) -> VfsResult<MutexGuard<'_, TransferSession<H, S>>> {
    session
        .lock()
        .map_err(|_| VfsError::access_denied("transfer session lock poisoned"))
}

pub(crate) fn ensure_active(token: &TransferToken) -> VfsResult<()> {
    if token.status.is_active() {
        Ok(())
    } else {
        Err(VfsError::transfer_status_invalid(format!(
            "transfer {} is {:?}",
            token.transfer_id, token.status
        )))
    }
}

pub(crate) fn status_of<H, S>(
    store: &dyn TransferStore<TransferSession<H, S>>,
    transfer_id: &str,
) -> VfsResult<TransferStatus> {
    let session = fetch(store, transfer_id)?;
    let guard = lock_session(&session)?;
    Ok(guard.token.status)
}

pub(crate) fn token_of<H, S>(
    store: &dyn TransferStore<TransferSession<H, S>>,
    transfer_id: &str,
) -> VfsResult<TransferToken> {
    let session = fetch(store, transfer_id)?;
    let guard = lock_session(&session)?;
    Ok(guard.token.clone())
}

/// Pause a session, closing its stream through `close`.
pub(crate) fn pause<H, S>(
    store: &dyn TransferStore<TransferSession<H, S>>,
    transfer_id: &str,
    close: impl FnOnce(&mut TransferSession<H, S>) -> VfsResult<()>,
) -> VfsResult<TransferToken> {
    let session = fetch(store, transfer_id)?;
    let mut guard = lock_session(&session)?;
    ensure_active(&guard.token)?;

    close(&mut *guard)?;
    guard.token.status = TransferStatus::Paused;
    debug!(transfer_id, "Transfer paused");
    Ok(guard.token.clone())
}

/// Remove a session from the store for completion or cancellation.
///
/// The session keeps its chain lock until the caller closes it.
pub(crate) fn take_session<H, S>(
    store: &dyn TransferStore<TransferSession<H, S>>,
    transfer_id: &str,
) -> VfsResult<SharedSession<H, S>> {
    let session = store
        .remove(transfer_id)
        .ok_or_else(|| VfsError::unknown_transfer(transfer_id))?;
    ensure_active(&lock_session(&session)?.token)?;
    Ok(session)
}

/// Drop the stream and the chain lock of a session in a terminal state.
pub(crate) fn close_session<H, S>(session: &mut TransferSession<H, S>, status: TransferStatus) {
    session.token.status = status;
    session.stream = None;
    session.guard = None;
}

/// Flush and close a write stream.
pub(crate) fn flush_stream<W: Write>(stream: &mut Option<W>) -> VfsResult<()> {
    if let Some(mut writer) = stream.take() {
        writer
            .flush()
            .map_err(|e| VfsError::backend("could not flush upload", e))?;
    }
    Ok(())
}

/// Lowercase hex SHA-256 of everything `reader` yields.
pub fn hash_stream<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Ids of expired, still active sessions.
pub(crate) fn expired_ids<H, S>(
    store: &dyn TransferStore<TransferSession<H, S>>,
    now: u64,
) -> Vec<String> {
    store
        .transfer_ids()
        .into_iter()
        .filter(|id| {
            let Some(session) = store.get(id) else {
                return false;
            };
            let expired = match session.lock() {
                Ok(guard) => guard.token.status.is_active() && guard.token.is_expired(now),
                Err(_) => {
                    warn!(transfer_id = %id, "Skipping poisoned transfer session");
                    false
                }
            };
            expired
        })
        .collect()
}
