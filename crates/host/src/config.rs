use std::time::Duration;

use peershare_crypto::{EncryptionKey, KeyDerivation};
use peershare_protocol::HostFeatures;
use peershare_protocol::constants::{
    DEFAULT_CHUNK_SIZE, MAX_PASSPHRASE_ATTEMPTS, PROTOCOL_VERSION, UPLOAD_GC_INTERVAL,
    UPLOAD_IDLE_TIMEOUT,
};

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Display name advertised to clients.
    pub name: String,
    /// Session passphrase. `None` means plaintext sessions.
    pub passphrase: Option<String>,
    pub allow_uploads: bool,
    /// Chunk size used when a transfer request does not ask for one.
    pub chunk_size: u64,
    /// Wrong passphrases tolerated per link before it is closed.
    pub max_passphrase_attempts: u32,
    /// Uploads idle this long are garbage-collected.
    pub upload_idle_timeout: Duration,
    pub gc_interval: Duration,
    pub key_derivation: KeyDerivation,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "peershare".into(),
            passphrase: None,
            allow_uploads: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_passphrase_attempts: MAX_PASSPHRASE_ATTEMPTS,
            upload_idle_timeout: UPLOAD_IDLE_TIMEOUT,
            gc_interval: UPLOAD_GC_INTERVAL,
            key_derivation: KeyDerivation::default(),
        }
    }
}

impl HostConfig {
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_uploads(mut self, allow: bool) -> Self {
        self.allow_uploads = allow;
        self
    }

    /// Features advertised to clients on a successful handshake.
    pub fn features(&self) -> HostFeatures {
        HostFeatures {
            upload_allowed: self.allow_uploads,
            encrypted: self.passphrase.is_some(),
            chunk_size: self.chunk_size,
            name: self.name.clone(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Derives the session key from the passphrase, if one is set.
    pub fn session_key(&self) -> Option<EncryptionKey> {
        self.passphrase
            .as_deref()
            .map(|p| self.key_derivation.derive(p))
    }
}
