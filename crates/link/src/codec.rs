//! Envelope codec with opportunistic encryption.
//!
//! With a key in the [`KeySlot`], every non-handshake message is
//! serialized, sealed, and sent as
//! `{type: ENCRYPTED_REQUEST|ENCRYPTED_RESPONSE, payload: {ciphertext, nonce}}`.
//! Handshake messages always travel in clear. Inbound wrappers are unwrapped
//! exactly once.

use peershare_protocol::constants::MAX_MESSAGE_SIZE;
use peershare_protocol::{EncryptedPayload, Message, MessageType};
use tracing::trace;

use crate::LinkError;
use crate::key::KeySlot;

/// Which side of the link the codec serves; selects the wrapper type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

impl Role {
    fn wrapper_type(self) -> MessageType {
        match self {
            Role::Host => MessageType::EncryptedResponse,
            Role::Client => MessageType::EncryptedRequest,
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub message: Message,
    /// Whether it arrived inside an encrypted wrapper.
    pub encrypted: bool,
}

#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    role: Role,
    key: KeySlot,
}

impl EnvelopeCodec {
    pub fn new(role: Role, key: KeySlot) -> Self {
        Self { role, key }
    }

    pub fn key(&self) -> &KeySlot {
        &self.key
    }

    /// Serializes `msg`, sealing it when a key is set.
    pub async fn encode(&self, msg: &Message) -> Result<Vec<u8>, LinkError> {
        let plain = msg.to_bytes()?;
        let frame = match self.key.get().await {
            Some(key) if !msg.msg_type.is_handshake() => {
                let sealed = peershare_crypto::encrypt(&key, &plain)?;
                let payload = EncryptedPayload {
                    ciphertext: sealed.ciphertext,
                    nonce: sealed.nonce.to_vec(),
                };
                Message::new(self.role.wrapper_type(), Some(&payload), None)?.to_bytes()?
            }
            _ => plain,
        };
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }
        trace!(msg_type = ?msg.msg_type, len = frame.len(), "encoded frame");
        Ok(frame)
    }

    /// Parses an inbound frame, unwrapping one level of encryption.
    pub async fn decode(&self, frame: &[u8]) -> Result<Decoded, LinkError> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }
        let msg = Message::from_bytes(frame)?;
        if !msg.msg_type.is_encrypted() {
            return Ok(Decoded {
                message: msg,
                encrypted: false,
            });
        }

        let key = self.key.get().await.ok_or(LinkError::NoKey)?;
        let payload: EncryptedPayload = msg
            .parse_payload()?
            .ok_or(peershare_protocol::ProtocolError::MissingPayload(msg.msg_type))?;
        let plain = peershare_crypto::decrypt(&key, &payload.ciphertext, &payload.nonce)?;
        let inner = Message::from_bytes(&plain)?;
        if inner.msg_type.is_encrypted() {
            return Err(LinkError::NestedEncryption);
        }
        Ok(Decoded {
            message: inner,
            encrypted: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peershare_crypto::KeyDerivation;
    use peershare_protocol::messages::{DirectoryRequest, MetaRequest};

    fn dir_request() -> Message {
        Message::request(
            MessageType::DirectoryRequest,
            &DirectoryRequest { path: "/".into() },
            "c1",
        )
        .unwrap()
    }

    async fn keyed(role: Role, pass: &str) -> EnvelopeCodec {
        let slot = KeySlot::new();
        slot.set(KeyDerivation::with_iterations(1).derive(pass)).await;
        EnvelopeCodec::new(role, slot)
    }

    #[tokio::test]
    async fn plaintext_without_key() {
        let codec = EnvelopeCodec::new(Role::Client, KeySlot::new());
        let frame = codec.encode(&dir_request()).await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(raw["type"], "DIRECTORY_REQUEST");

        let decoded = codec.decode(&frame).await.unwrap();
        assert!(!decoded.encrypted);
        assert_eq!(decoded.message.correlation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn sealed_roundtrip_between_roles() {
        let client = keyed(Role::Client, "pw").await;
        let host = keyed(Role::Host, "pw").await;

        let frame = client.encode(&dir_request()).await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(raw["type"], "ENCRYPTED_REQUEST");
        assert!(raw.get("correlationId").is_none());
        assert!(!String::from_utf8_lossy(&frame).contains("DIRECTORY_REQUEST"));

        let decoded = host.decode(&frame).await.unwrap();
        assert!(decoded.encrypted);
        assert_eq!(decoded.message.msg_type, MessageType::DirectoryRequest);
        assert_eq!(decoded.message.correlation_id.as_deref(), Some("c1"));

        let reply = host
            .encode(&decoded.message.reply_error(404, "nope"))
            .await
            .unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(raw["type"], "ENCRYPTED_RESPONSE");
        let back = client.decode(&reply).await.unwrap();
        assert_eq!(back.message.error_payload().unwrap().code, 404);
    }

    #[tokio::test]
    async fn handshake_messages_stay_clear() {
        let codec = keyed(Role::Client, "pw").await;
        let hello = Message::request(
            MessageType::MetaRequest,
            &MetaRequest {
                message: "hello".into(),
                sealed: None,
                platform: "test".into(),
                version: "0".into(),
                protocol_version: 1,
            },
            "h1",
        )
        .unwrap();
        let frame = codec.encode(&hello).await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(raw["type"], "META_REQUEST");
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decode() {
        let client = keyed(Role::Client, "pw").await;
        let host = keyed(Role::Host, "other").await;
        let frame = client.encode(&dir_request()).await.unwrap();
        assert!(matches!(
            host.decode(&frame).await,
            Err(LinkError::Crypto(peershare_crypto::CryptoError::Decryption))
        ));
    }

    #[tokio::test]
    async fn encrypted_frame_without_key_is_rejected() {
        let client = keyed(Role::Client, "pw").await;
        let frame = client.encode(&dir_request()).await.unwrap();
        let host = EnvelopeCodec::new(Role::Host, KeySlot::new());
        assert!(matches!(host.decode(&frame).await, Err(LinkError::NoKey)));
    }

    #[tokio::test]
    async fn nested_wrappers_are_rejected() {
        let client = keyed(Role::Client, "pw").await;
        let inner = client.encode(&dir_request()).await.unwrap();
        let inner_msg = Message::from_bytes(&inner).unwrap();
        let outer = client.encode(&inner_msg).await.unwrap();

        let host = keyed(Role::Host, "pw").await;
        assert!(matches!(
            host.decode(&outer).await,
            Err(LinkError::NestedEncryption)
        ));
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let codec = EnvelopeCodec::new(Role::Host, KeySlot::new());
        let frame = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            codec.decode(&frame).await,
            Err(LinkError::FrameTooLarge(_))
        ));
    }
}
