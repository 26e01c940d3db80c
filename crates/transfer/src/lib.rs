//! Chunked transfer engine.
//!
//! Downloads are pulled one chunk at a time and consumed by a
//! [`ChunkProcessor`]: either [`BufferedProcessor`] (collect, then assemble)
//! or [`StreamingProcessor`] (write through to a [`ByteSink`] in index
//! order). Uploads are split client-side by an [`UploadScheduler`] and
//! reassembled host-side by an [`UploadAssembler`] that always flushes in
//! index order.

mod assembler;
mod download;
mod progress;
mod scheduler;
mod session;
mod sink;
mod source;
mod validation;

pub use assembler::{ChunkAccepted, MAX_PENDING_CHUNKS, UploadAssembler, UploadSummary};
pub use download::{BufferedProcessor, ChunkProcessor, ProcessorFuture, StreamingProcessor};
pub use progress::ProgressMeter;
pub use scheduler::UploadScheduler;
pub use session::{FileTransferSession, total_chunks_for};
pub use sink::{ByteSink, ChannelSink, SinkEvent, SinkFuture, SinkReceiver, channel_sink};
pub use source::{
    LocalFileSource, MemorySource, OrderedDigest, UploadSource, checksum_bytes, mime_for_name,
};
pub use validation::{normalize_shared_path, validate_upload_name};

/// Default chunk size: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = peershare_protocol::constants::DEFAULT_CHUNK_SIZE;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk {index} out of range (total {total})")]
    ChunkOutOfRange { index: u64, total: u64 },

    #[error("chunk {index} has {got} bytes, expected {expected}")]
    ChunkSizeMismatch { index: u64, expected: u64, got: u64 },

    #[error("chunk belongs to transfer {got}, expected {expected}")]
    WrongTransfer { expected: String, got: String },

    #[error("invalid range {start}..{end} for {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error("transfer incomplete: {} chunk(s) missing", missing.len())]
    Incomplete { missing: Vec<u64> },

    #[error("out-of-order buffer exceeded {0} chunks")]
    BufferOverflow(usize),

    #[error("sink aborted: {0}")]
    SinkAborted(String),

    #[error("sink already closed")]
    SinkClosed,

    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    #[error("chunk {index} failed after {attempts} attempts")]
    RetriesExhausted { index: u64, attempts: u32 },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("storage error: {0}")]
    Storage(String),
}
