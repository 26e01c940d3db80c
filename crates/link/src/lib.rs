//! Per-link plumbing shared by host and client.
//!
//! - [`transport`]: the [`PeerTransport`]/[`PeerChannel`] boundary and an
//!   in-process [`MemoryNetwork`].
//! - [`phase`]: the DISCONNECTED → HANDSHAKING → ACTIVE state machine and
//!   per-phase message admission.
//! - [`key`]: the connection-owned encryption key slot.
//! - [`codec`]: envelope (de)serialization with transparent encryption.

pub mod codec;
pub mod key;
pub mod phase;
pub mod transport;

pub use codec::{Decoded, EnvelopeCodec, Role};
pub use key::KeySlot;
pub use phase::{Admission, ConnectionPhase, PhaseEvent, PhaseMachine};
pub use transport::{
    ChannelEvent, ChannelReader, ChannelWriter, MemoryNetwork, PeerChannel, PeerListener,
    PeerTransport, TransportFuture,
};

use peershare_protocol::MessageType;

/// Errors from the link layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("channel closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] peershare_crypto::CryptoError),

    #[error("protocol error: {0}")]
    Protocol(#[from] peershare_protocol::ProtocolError),

    #[error("frame of {0} bytes exceeds the message size limit")]
    FrameTooLarge(usize),

    #[error("encrypted message received but no key is set")]
    NoKey,

    #[error("nested encrypted envelope")]
    NestedEncryption,

    #[error("{msg_type:?} not accepted while {phase:?}")]
    WrongPhase {
        phase: ConnectionPhase,
        msg_type: MessageType,
    },

    #[error("invalid phase transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: ConnectionPhase,
        event: PhaseEvent,
    },

    #[error("peer id already listening: {0}")]
    AddrInUse(String),

    #[error("no peer listening at {0}")]
    PeerNotFound(String),
}
