//! Client side of the passphrase handshake.
//!
//! The client opens with a plaintext `"hello"`. A host without a key
//! answers `"hello"` with its features and the link is active. A host with
//! a key answers `"encrypted"`; the client then asks a [`PassphrasePrompt`],
//! derives the key and sends `"hello"` sealed under it, repeating on
//! `"mismatch"` until the host accepts or gives up.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use peershare_crypto::EncryptionKey;
use peershare_protocol::constants::{
    ERR_CODE_UNAUTHORIZED, HANDSHAKE_ENCRYPTED, HANDSHAKE_HELLO, HANDSHAKE_MISMATCH,
};
use peershare_protocol::messages::{MetaRequest, MetaResponse};
use peershare_protocol::{EncryptedPayload, HostFeatures, MessageType};
use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::{ClientError, HandshakeError};

/// Boxed future returned by [`PassphrasePrompt`].
pub type PromptFuture<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

/// Why the passphrase is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptReason {
    /// The host requires encryption.
    Required { attempts_left: Option<u32> },
    /// The previous passphrase was wrong.
    Mismatch { attempts_left: Option<u32> },
}

/// Source of passphrases, typically a UI dialog.
///
/// Returning `None` abandons the handshake.
pub trait PassphrasePrompt: Send + Sync {
    fn passphrase(&self, reason: PromptReason) -> PromptFuture<'_>;
}

/// Never supplies a passphrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPassphrase;

impl PassphrasePrompt for NoPassphrase {
    fn passphrase(&self, _reason: PromptReason) -> PromptFuture<'_> {
        Box::pin(async { None })
    }
}

/// Supplies the same passphrase every time it is asked.
#[derive(Clone)]
pub struct FixedPassphrase(String);

impl FixedPassphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(passphrase.into())
    }
}

impl std::fmt::Debug for FixedPassphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FixedPassphrase(..)")
    }
}

impl PassphrasePrompt for FixedPassphrase {
    fn passphrase(&self, _reason: PromptReason) -> PromptFuture<'_> {
        let p = self.0.clone();
        Box::pin(async move { Some(p) })
    }
}

impl<P: PassphrasePrompt + ?Sized> PassphrasePrompt for Arc<P> {
    fn passphrase(&self, reason: PromptReason) -> PromptFuture<'_> {
        (**self).passphrase(reason)
    }
}

fn hello(inner: &ClientInner, sealed: Option<EncryptedPayload>) -> MetaRequest {
    MetaRequest {
        message: HANDSHAKE_HELLO.into(),
        sealed,
        platform: inner.config.platform.clone(),
        version: inner.config.version.clone(),
        protocol_version: inner.config.protocol_version,
    }
}

async fn send_hello(
    inner: &ClientInner,
    sealed: Option<EncryptedPayload>,
) -> Result<MetaResponse, ClientError> {
    let resp = inner
        .send_request(MessageType::MetaRequest, &hello(inner, sealed))
        .await
        .map_err(|e| match e {
            ClientError::Host { code, message } if code == ERR_CODE_UNAUTHORIZED => {
                HandshakeError::PassphraseRejected(message).into()
            }
            ClientError::Host { code, message } => {
                HandshakeError::Rejected { code, message }.into()
            }
            other => other,
        })?;
    inner.expect_payload(resp, MessageType::MetaResponse)
}

/// Runs the handshake to completion and returns the host's features.
///
/// The key (if any) is installed on the link only after the host accepted
/// it.
pub(crate) async fn perform_handshake(
    inner: &ClientInner,
    prompt: &dyn PassphrasePrompt,
) -> Result<HostFeatures, ClientError> {
    let mut resp = send_hello(inner, None).await?;
    let mut key: Option<EncryptionKey> = None;

    loop {
        let reason = match resp.message.as_str() {
            HANDSHAKE_HELLO => {
                let features = resp.features.ok_or_else(|| {
                    HandshakeError::Unexpected("accepted without features".into())
                })?;
                if let Some(key) = key {
                    inner.install_key(key).await;
                }
                inner.activate().await?;
                info!(
                    host = %features.name,
                    encrypted = features.encrypted,
                    uploads = features.upload_allowed,
                    "handshake complete"
                );
                return Ok(features);
            }
            HANDSHAKE_ENCRYPTED => {
                debug!("host requires a passphrase");
                PromptReason::Required {
                    attempts_left: resp.attempts_left,
                }
            }
            HANDSHAKE_MISMATCH => {
                warn!(attempts_left = ?resp.attempts_left, "passphrase mismatch");
                PromptReason::Mismatch {
                    attempts_left: resp.attempts_left,
                }
            }
            other => return Err(HandshakeError::Unexpected(other.to_string()).into()),
        };

        let passphrase = prompt
            .passphrase(reason)
            .await
            .ok_or(HandshakeError::PassphraseRequired)?;
        let candidate = inner.config.key_derivation.derive(&passphrase);
        let sealed = peershare_crypto::encrypt(&candidate, HANDSHAKE_HELLO.as_bytes())?;
        key = Some(candidate);
        resp = send_hello(
            inner,
            Some(EncryptedPayload {
                ciphertext: sealed.ciphertext,
                nonce: sealed.nonce.to_vec(),
            }),
        )
        .await?;
    }
}
