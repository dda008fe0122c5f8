//! Transfer tokens and data blocks for resumable chunked transfers.

use serde::{Deserialize, Serialize};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Resource bytes flow from the gateway to the client.
    Download,
    /// Resource bytes flow from the client to the gateway.
    Upload,
}

/// Lifecycle state of a transfer.
///
/// `Starting -> Running <-> Paused -> Completed`, or `Aborted` from any
/// active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Token issued, no block transmitted yet.
    Starting,
    /// At least one block transmitted.
    Running,
    /// Stream closed, lock and token kept for resumption.
    Paused,
    /// Finished successfully (terminal).
    Completed,
    /// Cancelled or failed (terminal).
    Aborted,
}

impl TransferStatus {
    /// Returns true while blocks may still be transmitted.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

/// Block ordering a transfer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionCapability {
    /// Every block must be exactly one past the last transmitted block.
    StrictSequential,
    /// Sequential, but already transmitted blocks may be requested again.
    SequentialWithRetransmission,
    /// Blocks may be transmitted in any order.
    #[default]
    Random,
}

impl TransmissionCapability {
    /// Check whether `requested` may follow `last_transmitted`.
    pub fn permits(&self, last_transmitted: Option<u64>, requested: u64) -> bool {
        let next = last_transmitted.map_or(0, |last| last.saturating_add(1));
        match self {
            Self::StrictSequential => requested == next,
            Self::SequentialWithRetransmission => requested <= next,
            Self::Random => true,
        }
    }
}

/// Server-side session handle for an upload or download, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToken {
    /// Opaque, unique transfer identifier.
    pub transfer_id: String,
    /// Download or upload.
    pub direction: TransferDirection,
    /// Client-visible path of the transferred file.
    pub resource_identifier: String,
    /// File name.
    pub resource_name: String,
    /// Content type of the file.
    pub content_type: String,
    /// Total length of the resource in bytes.
    pub resource_length: u64,
    /// Block size for downloads, maximum accepted block size for uploads.
    pub max_block_size: u64,
    /// Number of blocks needed to move the whole resource.
    pub total_block_count: u64,
    /// Current lifecycle state.
    pub status: TransferStatus,
    /// Block ordering accepted by this transfer.
    pub capability: TransmissionCapability,
    /// Creation timestamp (Unix epoch seconds).
    pub created: u64,
    /// Advisory expiration timestamp (Unix epoch seconds).
    pub expiration: Option<u64>,
    /// SHA-256 of the whole resource (hex), if requested for a download.
    pub resource_hash: Option<String>,
    /// Number of the last transmitted block.
    pub last_transmitted_block: Option<u64>,
    /// Offset the next sequential block is expected at.
    pub next_block_offset: u64,
    /// Total number of bytes moved so far, retransmissions included.
    pub transmitted_bytes: u64,
}

impl TransferToken {
    /// Returns true if the advisory expiration time lies before `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration.is_some_and(|expiration| expiration < now)
    }
}

/// Number of blocks of `block_size` bytes needed for `length` bytes.
///
/// An empty resource still takes one (empty) block.
pub fn block_count(length: u64, block_size: u64) -> u64 {
    if length == 0 || block_size == 0 {
        return 1;
    }
    length.div_ceil(block_size)
}

/// A bounded slice of resource bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlock {
    /// Transfer this block belongs to.
    pub transfer_token_id: String,
    /// Zero-based block number.
    pub block_number: u64,
    /// Offset of the first byte within the resource.
    pub offset: u64,
    /// Block payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Whether this block completes the transfer.
    pub is_last_block: bool,
}

impl DataBlock {
    /// Length of the block payload.
    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }
}
