//! Wire protocol for PeerShare host/client sessions.
//!
//! Every message travels as a JSON [`Message`] envelope
//! `{type, payload, correlationId?}`. [`Body`] gives the typed view of the
//! payload for each [`MessageType`].

pub mod body;
pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use body::Body;
pub use constants::MessageType;
pub use envelope::Message;
pub use messages::{EncryptedPayload, ErrorPayload};
pub use types::{FileEntry, HostFeatures, TransferProgress, TransferStatus};

/// Errors decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing payload for {0:?}")]
    MissingPayload(MessageType),

    #[error("unknown message type")]
    UnknownType,
}
