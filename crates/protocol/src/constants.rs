use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version advertised in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default chunk size for both downloads and uploads (512 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

/// Largest chunk size a peer may ask for (8 MiB).
pub const MAX_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum encoded message size in bytes.
///
/// A chunk travels base64-encoded inside JSON and may be wrapped again by
/// the encrypted envelope, so this leaves room for two rounds of 4/3 growth
/// on top of [`MAX_CHUNK_SIZE`].
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Timeout for request/response operations.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wrong passphrases tolerated before the host tears the link down.
pub const MAX_PASSPHRASE_ATTEMPTS: u32 = 3;

/// Idle time after which the host garbage-collects an upload session.
pub const UPLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How often the host scans for idle upload sessions.
pub const UPLOAD_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of upload chunks in flight at once.
pub const DEFAULT_CONCURRENT_UPLOADS: usize = 3;

/// Default per-chunk upload retry budget.
pub const DEFAULT_UPLOAD_RETRIES: u32 = 3;

/// Default pause before a failed upload chunk is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Out-of-order chunks a streaming download may hold before giving up.
pub const DEFAULT_MAX_BUFFERED_CHUNKS: usize = 16;

/// Literal plaintext exchanged (and encrypted) during the handshake.
pub const HANDSHAKE_HELLO: &str = "hello";

/// Host reply telling the client a passphrase is required.
pub const HANDSHAKE_ENCRYPTED: &str = "encrypted";

/// Host reply telling the client its passphrase was wrong.
pub const HANDSHAKE_MISMATCH: &str = "mismatch";

/// Wire message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Handshake
    MetaRequest,
    MetaResponse,

    Error,

    // Browsing
    DirectoryRequest,
    DirectoryResponse,
    FileInfoRequest,
    FileInfoResponse,

    // Downloads
    FileTransferRequest,
    FileTransferResponse,
    FileChunkRequest,
    FileChunkResponse,
    FileTransferCancel,

    // Uploads
    FileUploadRequest,
    FileUploadResponse,
    FileUploadChunk,
    FileUploadChunkAck,
    FileUploadComplete,
    FileUploadCancel,

    // Encrypted wrappers
    EncryptedRequest,
    EncryptedResponse,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns `true` for the two handshake message types.
    pub fn is_handshake(self) -> bool {
        matches!(self, MessageType::MetaRequest | MessageType::MetaResponse)
    }

    /// Returns `true` for the encrypted envelope wrappers.
    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            MessageType::EncryptedRequest | MessageType::EncryptedResponse
        )
    }

    /// Returns `true` for directory, file and upload traffic that is only
    /// valid once the link is active.
    pub fn is_application(self) -> bool {
        !matches!(
            self,
            MessageType::MetaRequest
                | MessageType::MetaResponse
                | MessageType::Error
                | MessageType::EncryptedRequest
                | MessageType::EncryptedResponse
                | MessageType::Unknown
        )
    }
}

/// Common wire error codes.
pub const ERR_CODE_BAD_REQUEST: i32 = 400;
pub const ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const ERR_CODE_FORBIDDEN: i32 = 403;
pub const ERR_CODE_NOT_FOUND: i32 = 404;
pub const ERR_CODE_CONFLICT: i32 = 409;
pub const ERR_CODE_RANGE: i32 = 416;
pub const ERR_CODE_HANDSHAKE_REQUIRED: i32 = 428;
pub const ERR_CODE_INTERNAL: i32 = 500;
pub const ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
