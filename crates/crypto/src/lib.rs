//! Passphrase-derived keys and authenticated encryption.
//!
//! Keys come from PBKDF2-HMAC-SHA256 over a fixed salt, so the same
//! passphrase always yields the same key on both peers while each guess
//! costs a full derivation. Payloads are sealed with ChaCha20-Poly1305
//! under a fresh random 96-bit nonce per call.

use std::fmt;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha2::Sha256;

/// Key length in bytes.
pub const KEY_SIZE: usize = 32;

/// Nonce length in bytes.
pub const NONCE_SIZE: usize = 12;

/// Fixed salt shared by every peer.
pub const DEFAULT_SALT: &[u8] = b"peershare-session-salt-v1";

/// PBKDF2 rounds used unless a configuration overrides them.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Errors from the crypto module.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    /// Wrong key, wrong nonce or tampered ciphertext.
    #[error("decryption failed")]
    Decryption,

    #[error("invalid nonce length: {0}")]
    InvalidNonce(usize),
}

/// Symmetric session key.
///
/// Never serialized; `Debug` does not print the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(&self.0.into())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Key derivation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDerivation {
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self {
            salt: DEFAULT_SALT.to_vec(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl KeyDerivation {
    /// Creates parameters with a custom iteration count and the default salt.
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
            ..Self::default()
        }
    }

    /// Derives a key from `passphrase`. Deterministic for fixed parameters.
    pub fn derive(&self, passphrase: &str) -> EncryptionKey {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            &self.salt,
            self.iterations.max(1),
            &mut key,
        );
        EncryptionKey(key)
    }
}

/// Derives a key with the default parameters.
pub fn derive_key(passphrase: &str) -> EncryptionKey {
    KeyDerivation::default().derive(passphrase)
}

/// Ciphertext together with the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Encrypts `plaintext` under a fresh random nonce.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok(Sealed {
        ciphertext,
        nonce: nonce.into(),
    })
}

/// Decrypts and authenticates `ciphertext`.
///
/// Fails with [`CryptoError::Decryption`] on any key/nonce mismatch or
/// tampering; never returns partial plaintext.
pub fn decrypt(
    key: &EncryptionKey,
    ciphertext: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonce(nonce.len()));
    }
    key.cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}
