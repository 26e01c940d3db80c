use std::time::Duration;

use peershare_crypto::KeyDerivation;
use peershare_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENT_UPLOADS, DEFAULT_MAX_BUFFERED_CHUNKS,
    DEFAULT_RETRY_DELAY, DEFAULT_UPLOAD_RETRIES, PROTOCOL_VERSION, REQUEST_TIMEOUT,
};

/// Rounds of re-requesting missing chunks before a buffered download fails.
pub const DEFAULT_MAX_MISSING_RETRIES: u32 = 3;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reported to the host in the handshake.
    pub platform: String,
    pub version: String,
    pub protocol_version: u32,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Chunk size asked for on downloads. `None` lets the host decide.
    pub chunk_size: Option<u64>,
    /// Out-of-order chunks a streaming download may hold.
    pub max_buffered_chunks: usize,
    pub max_missing_retries: u32,
    pub key_derivation: KeyDerivation,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            request_timeout: REQUEST_TIMEOUT,
            chunk_size: None,
            max_buffered_chunks: DEFAULT_MAX_BUFFERED_CHUNKS,
            max_missing_retries: DEFAULT_MAX_MISSING_RETRIES,
            key_derivation: KeyDerivation::default(),
        }
    }
}

/// Options for one upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    /// Chunks in flight at once.
    pub concurrent_uploads: usize,
    /// Failed sends tolerated per chunk.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Timeout for each upload request and for the final completion.
    pub timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrent_uploads: DEFAULT_CONCURRENT_UPLOADS,
            retries: DEFAULT_UPLOAD_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: REQUEST_TIMEOUT,
        }
    }
}
