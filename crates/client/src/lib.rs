//! Client peer.
//!
//! Connects to a host over any [`PeerTransport`](peershare_link::PeerTransport),
//! runs the passphrase handshake, then browses, downloads (buffered or
//! streamed into a sink) and uploads with bounded concurrency and retries.

mod client;
pub mod config;
mod correlator;
mod download;
pub mod handshake;
mod pumps;
mod upload;

pub use client::{DisconnectCallback, EventCallback, PeerClient};
pub use config::{ClientConfig, UploadOptions};
pub use download::StreamSession;
pub use handshake::{FixedPassphrase, NoPassphrase, PassphrasePrompt, PromptFuture, PromptReason};
pub use upload::UploadOutcome;

use peershare_protocol::MessageType;

/// Errors from the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("link error: {0}")]
    Link(#[from] peershare_link::LinkError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] peershare_transfer::TransferError),

    #[error("crypto error: {0}")]
    Crypto(#[from] peershare_crypto::CryptoError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("host error {code}: {message}")]
    Host { code: i32, message: String },

    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedResponse {
        expected: MessageType,
        got: MessageType,
    },

    #[error("missing payload in {0:?}")]
    MissingPayload(MessageType),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Ways the handshake can end without an active link.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The host wants a passphrase and the prompt gave none.
    #[error("host requires a passphrase")]
    PassphraseRequired,

    /// The host gave up after repeated wrong passphrases.
    #[error("passphrase rejected: {0}")]
    PassphraseRejected(String),

    #[error("host rejected handshake ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("unexpected handshake reply: {0}")]
    Unexpected(String),
}
