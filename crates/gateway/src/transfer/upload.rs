//! Block-wise uploads.

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use protocol::{
    block_count, DataBlock, TransferDirection, TransferStatus, TransferToken,
    TransmissionCapability, VfsError, VfsResult,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    close_session, ensure_active, expired_ids, fetch, flush_stream, hash_stream, lock_session,
    pause, status_of, take_session, token_of, InMemoryTransferStore, TransferHandler,
    TransferSession, TransferStore,
};
use crate::audit::Operation;
use crate::backend::{content_type_for, now_secs, BackendAdapter};
use crate::gateway::VfsGateway;
use crate::locking::LockKind;

type Session<B> = TransferSession<<B as BackendAdapter>::Handle, <B as BackendAdapter>::Writer>;

/// Upload sessions over a gateway.
///
/// The target file is write-locked for the whole session. Blocks are written
/// to a hidden staging file next to it, which replaces the target only once
/// the upload completes with the announced length (and hash, if given). A
/// block flagged `is_last_block` completes the session.
pub struct UploadTransfers<B: BackendAdapter> {
    gateway: Arc<VfsGateway<B>>,
    store: Arc<dyn TransferStore<Session<B>>>,
}

impl<B: BackendAdapter> UploadTransfers<B> {
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

    /// Start an upload of `resource_length` bytes to `path`.
    pub fn request_upload_token(
        &self,
        path: &str,
        overwrite: bool,
        resource_length: u64,
    ) -> VfsResult<TransferToken> {
        let op = Operation::RequestUpload;
        self.gateway.run(op, path, || {
            let settings = self.gateway.transfer_settings();
            if resource_length > settings.max_file_size {
                return Err(VfsError::access_denied(format!(
                    "file too large: {resource_length} bytes exceeds limit of {} bytes",
                    settings.max_file_size
                )));
            }

            let (item, existed) = self.gateway.prepare_write(path, overwrite, op)?;
            let guard = self.gateway.lock(&item, LockKind::Write)?;

            let transfer_id = Uuid::new_v4().to_string();
            let staging = self.gateway.staging_handle(&item, &transfer_id)?;

            let block_size = settings.block_size(None);
            let now = now_secs();
            let token = TransferToken {
                transfer_id,
                direction: TransferDirection::Upload,
                resource_identifier: item.info.full_name.clone(),
                resource_name: item.info.name.clone(),
                content_type: content_type_for(&item.info.name).to_string(),
                resource_length,
                max_block_size: block_size,
                total_block_count: block_count(resource_length, block_size),
                status: TransferStatus::Starting,
                capability: settings.capability,
                created: now,
                expiration: settings.expiration(now),
                resource_hash: None,
                last_transmitted_block: None,
                next_block_offset: 0,
                transmitted_bytes: 0,
            };

            info!(
                transfer_id = %token.transfer_id,
                path = %item.info.full_name,
                length = resource_length,
                replace = existed,
                "Upload started"
            );
            self.store.add(
                token.transfer_id.clone(),
                TransferSession {
                    token: token.clone(),
                    handle: item.handle,
                    stream: None,
                    guard: Some(guard),
                    resource: item.info.full_name,
                    staging: Some(staging),
                },
            );
            Ok(token)
        })
    }

    /// Write one block. Returns the updated token.
    pub fn write_block(&self, block: &DataBlock) -> VfsResult<TransferToken> {
        let transfer_id = block.transfer_token_id.as_str();
        self.gateway.run(Operation::WriteBlock, transfer_id, || {
            let session = fetch(self.store.as_ref(), transfer_id)?;
            let mut session = lock_session(&session)?;
            ensure_active(&session.token)?;
            check_block(&session.token, block)?;

            if session.stream.is_none() {
                // After a pause the staged bytes are kept.
                let truncate = session.token.last_transmitted_block.is_none();
                let writer = self
                    .gateway
                    .backend()
                    .open_write(staging_of(&*session)?, truncate)
                    .map_err(|e| VfsError::backend("could not open upload staging file", e))?;
                session.stream = Some(writer);
            }
            match session.stream.as_mut() {
                Some(writer) => write_at(writer, block.offset, &block.data)
                    .map_err(|e| VfsError::backend("could not write block", e))?,
                None => return Err(VfsError::access_denied("upload stream unavailable")),
            }

            let end = block.offset + block.length();
            let token = &mut session.token;
            token.status = TransferStatus::Running;
            token.last_transmitted_block = Some(
                token
                    .last_transmitted_block
                    .map_or(block.block_number, |last| last.max(block.block_number)),
            );
            token.transmitted_bytes += block.length();
            token.next_block_offset = token.next_block_offset.max(end);
            debug!(
                transfer_id,
                block_number = block.block_number,
                offset = block.offset,
                len = block.data.len(),
                "Block written"
            );

            let snapshot = token.clone();
            drop(session);
            if block.is_last_block {
                return self.finish(transfer_id, None);
            }
            Ok(snapshot)
        })
    }

    /// Complete an upload after checking the SHA-256 of the written data.
    ///
    /// On mismatch the session is aborted, the staged bytes are discarded,
    /// and `IntegrityCheckFailed` is returned. The target is left untouched.
    pub fn complete_transfer_with_hash(
        &self,
        transfer_id: &str,
        expected_sha256: &str,
    ) -> VfsResult<TransferToken> {
        self.gateway.run(Operation::CompleteTransfer, transfer_id, || {
            self.finish(transfer_id, Some(expected_sha256))
        })
    }

    /// End a session by committing its staged bytes.
    ///
    /// Any failure aborts the session and discards the staging file.
    fn finish(
        &self,
        transfer_id: &str,
        expected_sha256: Option<&str>,
    ) -> VfsResult<TransferToken> {
        let session = take_session(self.store.as_ref(), transfer_id)?;
        let mut session = lock_session(&session)?;

        if let Err(e) = self.commit(&mut *session, expected_sha256) {
            session.stream = None;
            self.discard_staging(&session);
            close_session(&mut *session, TransferStatus::Aborted);
            warn!(transfer_id, path = %session.resource, error = %e, "Upload aborted");
            return Err(e);
        }

        close_session(&mut *session, TransferStatus::Completed);
        info!(
            transfer_id,
            path = %session.resource,
            bytes = session.token.transmitted_bytes,
            verified = expected_sha256.is_some(),
            "Upload completed"
        );
        Ok(session.token.clone())
    }

    /// Verify the staged bytes and move them over the target.
    fn commit(&self, session: &mut Session<B>, expected_sha256: Option<&str>) -> VfsResult<()> {
        self.close_stream(session)?;
        let staged = staging_of(session)?;
        let backend = self.gateway.backend();

        let received = backend
            .metadata(staged)
            .map_err(|e| VfsError::backend("could not inspect upload", e))?
            .map_or(0, |meta| meta.length);
        let announced = session.token.resource_length;
        if received != announced {
            return Err(VfsError::block_sequencing(format!(
                "incomplete upload of {}: {received} of {announced} bytes received",
                session.resource
            )));
        }

        if let Some(expected) = expected_sha256 {
            let actual = backend
                .open_read(staged)
                .and_then(hash_stream)
                .map_err(|e| VfsError::backend("could not hash upload", e))?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(VfsError::integrity_check_failed(format!(
                    "hash mismatch for {}: expected {expected}, got {actual}",
                    session.resource
                )));
            }
        }

        backend
            .replace_file(staged, &session.handle)
            .map_err(|e| VfsError::backend("could not commit upload", e))
    }

    /// Flush the stream, creating the staging file if no block was ever written.
    fn close_stream(&self, session: &mut Session<B>) -> VfsResult<()> {
        if session.stream.is_none() && session.token.last_transmitted_block.is_none() {
            let writer = self
                .gateway
                .backend()
                .open_write(staging_of(session)?, true)
                .map_err(|e| VfsError::backend("could not create upload staging file", e))?;
            session.stream = Some(writer);
        }
        flush_stream(&mut session.stream)
    }

    fn discard_staging(&self, session: &Session<B>) {
        if let Some(staged) = &session.staging {
            self.gateway.discard_staged(staged);
        }
    }
}

fn staging_of<H, S>(session: &TransferSession<H, S>) -> VfsResult<&H> {
    session
        .staging
        .as_ref()
        .ok_or_else(|| VfsError::access_denied("upload staging file unavailable"))
}

fn check_block(token: &TransferToken, block: &DataBlock) -> VfsResult<()> {
    if !token.capability.permits(token.last_transmitted_block, block.block_number) {
        return Err(VfsError::block_sequencing(format!(
            "block {} not allowed after {:?} ({:?})",
            block.block_number, token.last_transmitted_block, token.capability
        )));
    }
    if block.length() > token.max_block_size {
        return Err(VfsError::block_sequencing(format!(
            "block of {} bytes exceeds the maximum of {}",
            block.length(),
            token.max_block_size
        )));
    }
    if token.capability == TransmissionCapability::StrictSequential
        && block.offset != token.next_block_offset
    {
        return Err(VfsError::block_sequencing(format!(
            "expected block at offset {}, got {}",
            token.next_block_offset, block.offset
        )));
    }
    let end = block.offset.checked_add(block.length());
    if end.is_none_or(|end| end > token.resource_length) {
        return Err(VfsError::block_sequencing(format!(
            "block at offset {} exceeds the announced length of {}",
            block.offset, token.resource_length
        )));
    }
    Ok(())
}

fn write_at<W: Write + Seek>(writer: &mut W, offset: u64, data: &[u8]) -> std::io::Result<()> {
    writer.seek(SeekFrom::Start(offset))?;
    writer.write_all(data)
}

impl<B: BackendAdapter> TransferHandler for UploadTransfers<B> {
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
                flush_stream(&mut session.stream)
            })
        })
    }

    fn complete_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken> {
        self.gateway.run(Operation::CompleteTransfer, transfer_id, || {
            self.finish(transfer_id, None)
        })
    }

    fn cancel_transfer(&self, transfer_id: &str) -> VfsResult<TransferToken> {
        self.gateway.run(Operation::CancelTransfer, transfer_id, || {
            let session = take_session(self.store.as_ref(), transfer_id)?;
            let mut session = lock_session(&session)?;
            // Close before deleting; the lock is still held.
            session.stream = None;
            self.discard_staging(&session);
            close_session(&mut *session, TransferStatus::Aborted);
            info!(transfer_id, path = %session.resource, "Upload cancelled");
            Ok(session.token.clone())
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::transfer::TransferSettings;
    use protocol::ErrorKind;
    use std::path::{Path, PathBuf};

    fn uploads(capability: TransmissionCapability) -> (UploadTransfers<MemoryBackend>, MemoryBackend) {
        let backend = MemoryBackend::new();
        backend.create_dir_all("/data/in").unwrap();
        backend.put_file("/data/in/old.txt", "old contents").unwrap();
        let gateway = VfsGateway::builder(backend.clone())
            .root("/data")
            .relative_paths(true)
            .transfer_settings(TransferSettings {
                default_block_size: 4,
                max_block_size: 4,
                max_file_size: 64,
                capability,
                ..TransferSettings::default()
            })
            .build()
            .unwrap();
        (UploadTransfers::new(Arc::new(gateway)), backend)
    }

    fn block(id: &str, n: u64, offset: u64, data: &[u8], last: bool) -> DataBlock {
        DataBlock {
            transfer_token_id: id.to_string(),
            block_number: n,
            offset,
            data: data.to_vec(),
            is_last_block: last,
        }
    }

    /// Staging files left in the upload folder.
    fn staged_files(backend: &MemoryBackend) -> Vec<PathBuf> {
        backend
            .list_child_files(&PathBuf::from("/data/in"))
            .unwrap()
            .into_iter()
            .filter(|path| path.to_string_lossy().ends_with(".partial"))
            .collect()
    }

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_upload_roundtrip_with_hash() {
        let (uploads, backend) = uploads(TransmissionCapability::StrictSequential);
        let token = uploads
            .request_upload_token("vfs:/in/new.txt", false, 11)
            .unwrap();
        assert_eq!(token.total_block_count, 3);
        let id = token.transfer_id;

        uploads.write_block(&block(&id, 0, 0, b"hell", false)).unwrap();
        uploads.write_block(&block(&id, 1, 4, b"o wo", false)).unwrap();
        let token = uploads.write_block(&block(&id, 2, 8, b"rld", false)).unwrap();
        assert_eq!(token.transmitted_bytes, 11);

        let done = uploads
            .complete_transfer_with_hash(&id, &HELLO_WORLD_SHA256.to_uppercase())
            .unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(backend.file_contents("/data/in/new.txt").unwrap(), b"hello world");
        assert_eq!(uploads.gateway().locks().registry().held_count(), 0);
    }

    #[test]
    fn test_last_block_completes() {
        let (uploads, backend) = uploads(TransmissionCapability::Random);
        let id = uploads
            .request_upload_token("vfs:/in/r.bin", false, 6)
            .unwrap()
            .transfer_id;

        uploads.write_block(&block(&id, 1, 4, b"ef", false)).unwrap();
        let done = uploads.write_block(&block(&id, 0, 0, b"abcd", true)).unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(backend.file_contents("/data/in/r.bin").unwrap(), b"abcdef");

        let err = uploads.transfer_status(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTransfer);
    }

    #[test]
    fn test_hash_mismatch_aborts() {
        let (uploads, backend) = uploads(TransmissionCapability::Random);
        let id = uploads
            .request_upload_token("vfs:/in/bad.txt", false, 4)
            .unwrap()
            .transfer_id;
        uploads.write_block(&block(&id, 0, 0, b"data", false)).unwrap();

        let err = uploads
            .complete_transfer_with_hash(&id, HELLO_WORLD_SHA256)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityCheckFailed);
        assert!(!backend.exists(Path::new("/data/in/bad.txt")));
        assert!(staged_files(&backend).is_empty());
        assert_eq!(
            uploads.transfer_status(&id).unwrap_err().kind(),
            ErrorKind::UnknownTransfer
        );
        assert_eq!(uploads.gateway().locks().registry().held_count(), 0);
    }

    #[test]
    fn test_hash_mismatch_keeps_replaced_file() {
        let (uploads, backend) = uploads(TransmissionCapability::Random);
        let id = uploads
            .request_upload_token("vfs:/in/old.txt", true, 4)
            .unwrap()
            .transfer_id;
        uploads.write_block(&block(&id, 0, 0, b"evil", false)).unwrap();

        let err = uploads
            .complete_transfer_with_hash(&id, HELLO_WORLD_SHA256)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityCheckFailed);
        assert_eq!(backend.file_contents("/data/in/old.txt").unwrap(), b"old contents");
        assert!(staged_files(&backend).is_empty());
    }

    #[test]
    fn test_incomplete_upload_is_aborted() {
        let (uploads, backend) = uploads(TransmissionCapability::Random);
        let id = uploads
            .request_upload_token("vfs:/in/short.bin", false, 8)
            .unwrap()
            .transfer_id;

        let err = uploads.write_block(&block(&id, 0, 0, b"abcd", true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockSequencingError);
        assert!(!backend.exists(Path::new("/data/in/short.bin")));
        assert!(staged_files(&backend).is_empty());
        assert_eq!(
            uploads.transfer_status(&id).unwrap_err().kind(),
            ErrorKind::UnknownTransfer
        );
        assert_eq!(uploads.gateway().locks().registry().held_count(), 0);

        let id = uploads
            .request_upload_token("vfs:/in/old.txt", true, 8)
            .unwrap()
            .transfer_id;
        let err = uploads.complete_transfer(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockSequencingError);
        assert_eq!(backend.file_contents("/data/in/old.txt").unwrap(), b"old contents");
    }

    #[test]
    fn test_sequencing_errors() {
        let (uploads, _) = uploads(TransmissionCapability::StrictSequential);
        let id = uploads
            .request_upload_token("vfs:/in/s.bin", false, 8)
            .unwrap()
            .transfer_id;

        let skip = uploads.write_block(&block(&id, 1, 4, b"abcd", false)).unwrap_err();
        assert_eq!(skip.kind(), ErrorKind::DataBlockSequencingError);

        let wrong_offset = uploads.write_block(&block(&id, 0, 2, b"ab", false)).unwrap_err();
        assert_eq!(wrong_offset.kind(), ErrorKind::DataBlockSequencingError);

        let too_big = uploads.write_block(&block(&id, 0, 0, b"abcde", false)).unwrap_err();
        assert_eq!(too_big.kind(), ErrorKind::DataBlockSequencingError);

        uploads.write_block(&block(&id, 0, 0, b"abcd", false)).unwrap();
        let second = uploads.write_block(&block(&id, 1, 4, b"abcd", false));
        assert!(second.is_ok());
        let beyond = uploads.write_block(&block(&id, 2, 8, b"x", false)).unwrap_err();
        assert_eq!(beyond.kind(), ErrorKind::DataBlockSequencingError);
    }

    #[test]
    fn test_overwrite_rules_and_size_limit() {
        let (uploads, _) = uploads(TransmissionCapability::Random);
        let err = uploads
            .request_upload_token("vfs:/in/old.txt", false, 4)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAlreadyExists);

        let err = uploads
            .request_upload_token("vfs:/in/huge.bin", false, 65)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);

        let err = uploads
            .request_upload_token("vfs:/missing/x.bin", false, 1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
    }

    #[test]
    fn test_session_holds_write_lock() {
        let (uploads, _) = uploads(TransmissionCapability::Random);
        let token = uploads
            .request_upload_token("vfs:/in/old.txt", true, 2)
            .unwrap();

        let gateway = uploads.gateway();
        assert_eq!(
            gateway.read_file_bytes("vfs:/in/old.txt").unwrap_err().kind(),
            ErrorKind::ResourceLocked
        );
        assert_eq!(
            gateway.delete_folder("vfs:/in").unwrap_err().kind(),
            ErrorKind::ResourceLocked
        );
        let err = uploads
            .request_upload_token("vfs:/in/old.txt", true, 2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLocked);

        uploads.write_block(&block(&token.transfer_id, 0, 0, b"hi", true)).unwrap();
        assert_eq!(gateway.read_file_bytes("vfs:/in/old.txt").unwrap(), b"hi");
    }

    #[test]
    fn test_cancel_discards_staged_bytes() {
        let (uploads, backend) = uploads(TransmissionCapability::Random);
        let id = uploads
            .request_upload_token("vfs:/in/partial.bin", false, 8)
            .unwrap()
            .transfer_id;
        uploads.write_block(&block(&id, 0, 0, b"abcd", false)).unwrap();
        let cancelled = uploads.cancel_transfer(&id).unwrap();
        assert_eq!(cancelled.status, TransferStatus::Aborted);
        assert!(!backend.exists(Path::new("/data/in/partial.bin")));
        assert!(staged_files(&backend).is_empty());

        let id = uploads
            .request_upload_token("vfs:/in/old.txt", true, 8)
            .unwrap()
            .transfer_id;
        uploads.write_block(&block(&id, 0, 0, b"abcd", false)).unwrap();
        uploads.cancel_transfer(&id).unwrap();
        assert_eq!(backend.file_contents("/data/in/old.txt").unwrap(), b"old contents");
        assert!(staged_files(&backend).is_empty());
    }

    #[test]
    fn test_pause_then_resume_keeps_written_bytes() {
        let (uploads, backend) = uploads(TransmissionCapability::SequentialWithRetransmission);
        let id = uploads
            .request_upload_token("vfs:/in/p.bin", false, 8)
            .unwrap()
            .transfer_id;

        uploads.write_block(&block(&id, 0, 0, b"abcd", false)).unwrap();
        assert_eq!(uploads.pause_transfer(&id).unwrap().status, TransferStatus::Paused);
        assert!(!backend.exists(Path::new("/data/in/p.bin")));
        let staged = staged_files(&backend);
        assert_eq!(staged.len(), 1);
        assert_eq!(backend.file_contents(&staged[0]).unwrap(), b"abcd");

        uploads.write_block(&block(&id, 1, 4, b"efgh", true)).unwrap();
        assert_eq!(backend.file_contents("/data/in/p.bin").unwrap(), b"abcdefgh");
        assert!(staged_files(&backend).is_empty());
    }

    #[test]
    fn test_empty_upload_creates_file() {
        let (uploads, backend) = uploads(TransmissionCapability::Random);
        let id = uploads
            .request_upload_token("vfs:/in/empty", false, 0)
            .unwrap()
            .transfer_id;
        uploads.complete_transfer(&id).unwrap();
        assert_eq!(backend.file_contents("/data/in/empty").unwrap(), b"");
    }
}
