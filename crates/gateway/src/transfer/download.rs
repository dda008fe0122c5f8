//! Block-wise downloads.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use protocol::{
    block_count, DataBlock, TransferDirection, TransferStatus, TransferToken,
    TransmissionCapability, VfsError, VfsResult,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    close_session, ensure_active, expired_ids, fetch, hash_stream, lock_session, pause,
    status_of, take_session, token_of, InMemoryTransferStore, TransferHandler, TransferSession,
    TransferStore,
};
use crate::audit::Operation;
use crate::backend::{now_secs, BackendAdapter};
use crate::gateway::VfsGateway;
use crate::locking::LockKind;

type Session<B> = TransferSession<<B as BackendAdapter>::Handle, <B as BackendAdapter>::Reader>;

/// Download sessions over a gateway.
///
/// Blocks have a fixed size chosen when the token is issued: block `n`
/// starts at `n * max_block_size`. With a sequential capability the session
/// completes on its own once the last block has been read; with random
/// access the client completes it explicitly.
pub struct DownloadTransfers<B: BackendAdapter> {
    gateway: Arc<VfsGateway<B>>,
    store: Arc<dyn TransferStore<Session<B>>>,
}

impl<B: BackendAdapter> DownloadTransfers<B> {
    pub fn new(gateway: Arc<VfsGateway<B>>) -> Self {
        Self::with_store(gateway, Arc::new(InMemoryTransferStore::new()))
    }

    /// Use a custom session store.
    pub fn with_store(gateway: Arc<VfsGateway<B>>, store: Arc<dyn TransferStore<Session<B>>>) -> Self {
        Self { gateway, store }
    }

    pub fn gateway(&self) -> &Arc<VfsGateway<B>> {
        &self.gateway
    }

    /// Number of sessions currently held.
    pub fn active_transfers(&self) -> usize {
        self.store.len()
    }

    /// Start a download of the file at `path`.
    ///
    /// The file stays read-locked until the session ends. With
    /// `include_file_hash` the token carries the SHA-256 of the content.
    pub fn request_download_token(
        &self,
        path: &str,
        include_file_hash: bool,
        block_size: Option<u64>,
    ) -> VfsResult<TransferToken> {
        let op = Operation::RequestDownload;
        self.gateway.run(op, path, || {
            let item = self.gateway.prepare_read(path, op)?;
            let guard = self.gateway.lock(&item, LockKind::Read)?;
            let backend = self.gateway.backend();

            let resource_hash = if include_file_hash {
                let reader = backend
                    .open_read(&item.handle)
                    .map_err(|e| VfsError::backend("could not open file", e))?;
                Some(hash_stream(reader).map_err(|e| VfsError::backend("could not hash file", e))?)
            } else {
                None
            };

            let settings = self.gateway.transfer_settings();
            let block_size = settings.block_size(block_size);
            let length = item.info.length;
            let now = now_secs();

            let token = TransferToken {
                transfer_id: Uuid::new_v4().to_string(),
                direction: TransferDirection::Download,
                resource_identifier: item.info.full_name.clone(),
                resource_name: item.info.name.clone(),
                content_type: item
                    .info
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                resource_length: length,
                max_block_size: block_size,
                total_block_count: block_count(length, block_size),
                status: TransferStatus::Starting,
                capability: settings.capability,
                created: now,
                expiration: settings.expiration(now),
                resource_hash,
                last_transmitted_block: None,
                next_block_offset: 0,
                transmitted_bytes: 0,
            };

            info!(
                transfer_id = %token.transfer_id,
                path = %item.info.full_name,
                length,
                block_size,
                "Download started"
            );
            self.store.add(
                token.transfer_id.clone(),
                TransferSession {
                    token: token.clone(),
                    handle: item.handle,
                    stream: None,
                    guard: Some(guard),
                    resource: item.info.full_name,
                    staging: None,
                },
            );
            Ok(token)
        })
    }

    /// Read block `block_number` of a download.
    pub fn read_block(&self, transfer_id: &str, block_number: u64) -> VfsResult<DataBlock> {
        self.gateway.run(Operation::ReadBlock, transfer_id, || {
            let session = fetch(self.store.as_ref(), transfer_id)?;
            let mut session = lock_session(&session)?;
            ensure_active(&session.token)?;

            let token = &session.token;
            if !token.capability.permits(token.last_transmitted_block, block_number) {
                return Err(VfsError::block_sequencing(format!(
                    "block {block_number} not allowed after {:?} ({:?})",
                    token.last_transmitted_block, token.capability
                )));
            }

            let length = token.resource_length;
            let offset = block_number
                .checked_mul(token.max_block_size)
                .filter(|offset| *offset < length || (*offset == 0 && length == 0))
                .ok_or_else(|| {
                    VfsError::block_sequencing(format!(
                        "block {block_number} lies beyond the end of the resource"
                    ))
                })?;
            let size = token.max_block_size.min(length - offset);

            if session.stream.is_none() {
                let reader = self
                    .gateway
                    .backend()
                    .open_read(&session.handle)
                    .map_err(|e| VfsError::backend("could not open file", e))?;
                session.stream = Some(reader);
            }
            let data = match session.stream.as_mut() {
                Some(reader) => read_at(reader, offset, size)
                    .map_err(|e| VfsError::backend("could not read block", e))?,
                None => return Err(VfsError::access_denied("download stream unavailable")),
            };

            if data.len() as u64 != size {
                return Err(VfsError::block_sequencing(format!(
                    "block {block_number} returned {} of {size} bytes, the resource changed",
                    data.len()
                )));
            }

            let is_last_block = offset + size >= length;
            let token = &mut session.token;
            token.status = TransferStatus::Running;
            token.last_transmitted_block = Some(
                token
                    .last_transmitted_block
                    .map_or(block_number, |last| last.max(block_number)),
            );
            token.transmitted_bytes += data.len() as u64;
            token.next_block_offset = offset + data.len() as u64;
            debug!(transfer_id, block_number, offset, len = data.len(), "Block read");

            let auto_complete =
                is_last_block && token.capability != TransmissionCapability::Random;
            drop(session);
            if auto_complete {
                self.finish(transfer_id, TransferStatus::Completed)?;
            }

            Ok(DataBlock {
                transfer_token_id: transfer_id.to_string(),
                block_number,
                offset,
                data,
                is_last_block,
            })
        })
    }

    fn finish(&self, transfer_id: &str, status: TransferStatus) -> VfsResult<TransferToken> {
        let session = take_session(self.store.as_ref(), transfer_id)?;
        let mut session = lock_session(&session)?;
        close_session(&mut *session, status);
        info!(transfer_id, path = %session.resource, ?status, "Download finished");
        Ok(session.token.clone())
    }
}

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::with_capacity(size as usize);
    reader.take(size).read_to_end(&mut data)?;
    Ok(data)
}

impl<B: BackendAdapter> TransferHandler for DownloadTransfers<B> {
    fn transfer_status(&self, transfer_id: &str) -> VfsResult<TransferStatus> {
        self.gateway.run(Operation::TransferStatus, transfer_id, || {
            status_of(self.store.as_ref(), transfer_id)
        })
    }

    fn reload_token(&self, transfer_id: &str) -> VfsResult<TransferToken> {
        self.gateway.run(Operation::ReloadToken, transfer_id, || {
            token_of(self.store.as_ref(), transfer_id)
        })
    }

    fn pause_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken> {
        self.gateway.run(Operation::PauseTransfer, transfer_id, || {
            pause(self.store.as_ref(), transfer_id, |session| {
                session.stream = None;
                Ok(())
            })
        })
    }

    fn complete_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken> {
        self.gateway.run(Operation::CompleteTransfer, transfer_id, || {
            self.finish(transfer_id, TransferStatus::Completed)
        })
    }

    fn cancel_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken> {
        self.gateway.run(Operation::CancelTransfer, transfer_id, || {
            self.finish(transfer_id, TransferStatus::Aborted)
        })
    }

    fn max_block_size(&self) -> u64 {
        self.gateway.transfer_settings().max_block_size
    }

    fn transmission_capability(&self) -> TransmissionCapability {
        self.gateway.transfer_settings().capability
    }

    fn max_file_size(&self) -> u64 {
        self.gateway.transfer_settings().max_file_size
    }

    fn expired_transfers(&self, now: u64) -> Vec<String> {
        expired_ids(self.store.as_ref(), now)
    }
}
