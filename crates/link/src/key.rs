use std::sync::Arc;

use peershare_crypto::EncryptionKey;
use tokio::sync::RwLock;

/// Encryption key owned by one connection.
///
/// Cloning shares the slot between that connection's tasks; nothing else
/// sees it. Empty means traffic is plaintext.
#[derive(Debug, Clone, Default)]
pub struct KeySlot {
    inner: Arc<RwLock<Option<EncryptionKey>>>,
}

impl KeySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: EncryptionKey) {
        *self.inner.write().await = Some(key);
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }

    pub async fn get(&self) -> Option<EncryptionKey> {
        self.inner.read().await.clone()
    }

    pub async fn is_set(&self) -> bool {
        self.inner.read().await.is_some()
    }
}
