//! Host peer.
//!
//! Accepts links from a [`PeerListener`](peershare_link::PeerListener),
//! runs the passphrase handshake on each, then serves directory listings,
//! chunked downloads and (optionally) uploads through a [`Handler`].
//! [`ShareHandler`] is the stock handler over a [`FileSystem`] and a
//! [`BlobStore`].

mod blob;
mod config;
mod connection;
mod fs;
mod handler;
mod handshake;
mod server;
mod share;
mod uploads;

pub use blob::{BlobFuture, BlobStore, DirBlobStore, MemoryBlobStore, WriteRecord};
pub use config::HostConfig;
pub use connection::{LinkContext, LinkHandle, SendError, Sender};
pub use fs::{FileStat, FileSystem, FsError, FsFuture, LocalFileSystem};
pub use handler::{Handler, HandlerFuture};
pub use handshake::{HandshakeStep, HostHandshake};
pub use server::HostServer;
pub use share::{MAX_OPEN_TRANSFERS, ShareHandler};
pub use uploads::UploadRegistry;

use peershare_protocol::constants::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_CONFLICT, ERR_CODE_FORBIDDEN, ERR_CODE_INTERNAL,
    ERR_CODE_NOT_FOUND, ERR_CODE_RANGE,
};
use peershare_transfer::TransferError;

/// Send buffer capacity per link.
///
/// Downloads are pulled one chunk at a time and uploads are acknowledged
/// per chunk, so the queue stays short; 256 leaves room for bursts of
/// notifications.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("link error: {0}")]
    Link(#[from] peershare_link::LinkError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("file system error: {0}")]
    Fs(#[from] FsError),

    #[error("uploads are disabled")]
    UploadsDisabled,

    #[error("an upload named {0} is already in progress")]
    UploadNameInUse(String),

    #[error("unknown upload: {0}")]
    UnknownUpload(String),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("too many open transfers (limit {0})")]
    TooManyTransfers(usize),

    #[error("server already running")]
    AlreadyRunning,
}

impl HostError {
    /// Wire error code reported to the peer.
    pub fn code(&self) -> i32 {
        match self {
            HostError::Json(_) | HostError::Link(_) => ERR_CODE_BAD_REQUEST,
            HostError::Transfer(e) => match e {
                TransferError::ChunkOutOfRange { .. } | TransferError::InvalidRange { .. } => {
                    ERR_CODE_RANGE
                }
                TransferError::ChunkSizeMismatch { .. }
                | TransferError::InvalidChunkSize(_)
                | TransferError::InvalidPath(_)
                | TransferError::WrongTransfer { .. } => ERR_CODE_BAD_REQUEST,
                TransferError::Cancelled(_) | TransferError::BufferOverflow(_) => {
                    ERR_CODE_CONFLICT
                }
                _ => ERR_CODE_INTERNAL,
            },
            HostError::Fs(e) => match e {
                FsError::NotFound(_) => ERR_CODE_NOT_FOUND,
                FsError::NotADirectory(_) | FsError::NotAFile(_) | FsError::InvalidPath(_) => {
                    ERR_CODE_BAD_REQUEST
                }
                FsError::OutOfRange { .. } => ERR_CODE_RANGE,
                FsError::Io(_) => ERR_CODE_INTERNAL,
            },
            HostError::UploadsDisabled => ERR_CODE_FORBIDDEN,
            HostError::UploadNameInUse(_) | HostError::TooManyTransfers(_) => ERR_CODE_CONFLICT,
            HostError::UnknownUpload(_) | HostError::UnknownTransfer(_) => ERR_CODE_NOT_FOUND,
            HostError::Io(_) | HostError::AlreadyRunning => ERR_CODE_INTERNAL,
        }
    }
}
