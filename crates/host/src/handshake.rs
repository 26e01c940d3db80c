//! Host side of the passphrase handshake.
//!
//! The passphrase never crosses the wire. A client proves it knows the
//! passphrase by sending the literal `"hello"` sealed under the derived
//! key; the host only checks that it opens to exactly that string.

use peershare_crypto::EncryptionKey;
use peershare_protocol::HostFeatures;
use peershare_protocol::constants::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_UNAUTHORIZED, HANDSHAKE_ENCRYPTED, HANDSHAKE_HELLO,
    HANDSHAKE_MISMATCH,
};
use peershare_protocol::messages::{MetaRequest, MetaResponse};
use tracing::{debug, warn};

/// What the connection should do after one handshake message.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeStep {
    /// Send the response and stay in HANDSHAKING.
    Continue(MetaResponse),
    /// Send the response, install the key (if any), go ACTIVE.
    Accepted(MetaResponse),
    /// Send an ERROR, stay in HANDSHAKING.
    Rejected { code: i32, message: String },
    /// Send an ERROR and close the link.
    Failed { code: i32, message: String },
}

/// Per-link handshake state.
pub struct HostHandshake {
    key: Option<EncryptionKey>,
    features: HostFeatures,
    mismatches: u32,
    max_attempts: u32,
    done: bool,
}

impl HostHandshake {
    pub fn new(key: Option<EncryptionKey>, features: HostFeatures, max_attempts: u32) -> Self {
        Self {
            key,
            features,
            mismatches: 0,
            max_attempts: max_attempts.max(1),
            done: false,
        }
    }

    /// Key to install on success.
    pub fn key(&self) -> Option<&EncryptionKey> {
        self.key.as_ref()
    }

    pub fn mismatches(&self) -> u32 {
        self.mismatches
    }

    fn accepted(&mut self) -> HandshakeStep {
        self.done = true;
        HandshakeStep::Accepted(MetaResponse {
            message: HANDSHAKE_HELLO.into(),
            features: Some(self.features.clone()),
            attempts_left: None,
        })
    }

    /// Evaluates one META_REQUEST.
    pub fn handle(&mut self, req: &MetaRequest) -> HandshakeStep {
        if self.done {
            return HandshakeStep::Failed {
                code: ERR_CODE_BAD_REQUEST,
                message: "handshake already finished".into(),
            };
        }

        let Some(key) = &self.key else {
            if req.sealed.is_some() {
                return HandshakeStep::Rejected {
                    code: ERR_CODE_BAD_REQUEST,
                    message: "encryption is not enabled on this host".into(),
                };
            }
            return self.accepted();
        };

        let Some(sealed) = &req.sealed else {
            debug!("encrypted session, asking client for passphrase");
            return HandshakeStep::Continue(MetaResponse {
                message: HANDSHAKE_ENCRYPTED.into(),
                features: None,
                attempts_left: Some(self.max_attempts - self.mismatches),
            });
        };

        let opened = peershare_crypto::decrypt(key, &sealed.ciphertext, &sealed.nonce);
        if matches!(opened.as_deref(), Ok(plain) if plain == HANDSHAKE_HELLO.as_bytes()) {
            return self.accepted();
        }

        self.mismatches += 1;
        warn!(attempt = self.mismatches, "passphrase mismatch");
        if self.mismatches >= self.max_attempts {
            self.done = true;
            return HandshakeStep::Failed {
                code: ERR_CODE_UNAUTHORIZED,
                message: "too many passphrase attempts".into(),
            };
        }
        HandshakeStep::Continue(MetaResponse {
            message: HANDSHAKE_MISMATCH.into(),
            features: None,
            attempts_left: Some(self.max_attempts - self.mismatches),
        })
    }
}
