//! Host-wide registry of in-progress uploads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use peershare_protocol::messages::FileUploadRequest;
use peershare_transfer::{
    ByteSink, ChunkAccepted, TransferError, UploadAssembler, validate_upload_name,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::HostError;
use crate::blob::BlobStore;

type Assembler = UploadAssembler<Box<dyn ByteSink>>;

/// Failures after which an upload cannot continue and is dropped.
pub(crate) fn is_storage_failure(e: &TransferError) -> bool {
    matches!(
        e,
        TransferError::Io(_)
            | TransferError::Storage(_)
            | TransferError::SinkAborted(_)
            | TransferError::SinkClosed
    )
}

struct UploadEntry {
    link_id: String,
    file_name: String,
    assembler: Arc<Mutex<Assembler>>,
    completed: bool,
}

#[derive(Default)]
struct RegistryInner {
    uploads: HashMap<String, UploadEntry>,
    /// Blob names currently being written.
    reserved: HashSet<String>,
}

/// Tracks every upload on the host, across links.
///
/// A blob name can be written by one upload at a time. Completed uploads
/// stay registered (so late duplicate chunks are still acknowledged) until
/// the idle collector drops them.
#[derive(Clone)]
pub struct UploadRegistry {
    store: Arc<dyn BlobStore>,
    inner: Arc<Mutex<RegistryInner>>,
}

impl UploadRegistry {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    /// Starts an upload for `link_id`, returning its id.
    pub async fn begin(&self, link_id: &str, req: &FileUploadRequest) -> Result<String, HostError> {
        validate_upload_name(&req.file_name)?;

        {
            let mut inner = self.inner.lock().await;
            if !inner.reserved.insert(req.file_name.clone()) {
                return Err(HostError::UploadNameInUse(req.file_name.clone()));
            }
        }

        let sink = match self
            .store
            .create_writer(&req.file_name, &req.file_type, Some(req.file_size))
            .await
        {
            Ok(sink) => sink,
            Err(e) => {
                self.inner.lock().await.reserved.remove(&req.file_name);
                return Err(e.into());
            }
        };

        let upload_id = uuid::Uuid::new_v4().to_string();
        let assembler = match UploadAssembler::new(
            upload_id.clone(),
            req.file_name.clone(),
            req.file_size,
            req.chunk_size,
            req.total_chunks,
            sink,
        ) {
            Ok(a) => a,
            Err(e) => {
                self.inner.lock().await.reserved.remove(&req.file_name);
                return Err(e.into());
            }
        };
        let mut inner = self.inner.lock().await;
        inner.uploads.insert(
            upload_id.clone(),
            UploadEntry {
                link_id: link_id.to_string(),
                file_name: req.file_name.clone(),
                assembler: Arc::new(Mutex::new(assembler)),
                completed: false,
            },
        );
        info!(
            link = %link_id,
            %upload_id,
            file = %req.file_name,
            size = req.file_size,
            chunks = req.total_chunks,
            "upload started"
        );
        Ok(upload_id)
    }

    async fn assembler_for(
        &self,
        link_id: &str,
        upload_id: &str,
    ) -> Result<Arc<Mutex<Assembler>>, HostError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .uploads
            .get(upload_id)
            .ok_or_else(|| HostError::UnknownUpload(upload_id.to_string()))?;
        if entry.link_id != link_id {
            return Err(HostError::UnknownUpload(upload_id.to_string()));
        }
        Ok(entry.assembler.clone())
    }

    /// Applies one chunk. Storage failures abort the upload.
    pub async fn accept_chunk(
        &self,
        link_id: &str,
        upload_id: &str,
        index: u64,
        data: Vec<u8>,
        is_last: bool,
    ) -> Result<ChunkAccepted, HostError> {
        let assembler = self.assembler_for(link_id, upload_id).await?;
        let result = assembler.lock().await.accept_chunk(index, data, is_last).await;

        match result {
            Ok(accepted) => {
                if accepted.completed.is_some() {
                    self.mark_completed(upload_id).await;
                }
                Ok(accepted)
            }
            Err(e) if is_storage_failure(&e) => {
                warn!(%upload_id, "upload storage failed: {e}");
                self.remove(upload_id, &e.to_string()).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_completed(&self, upload_id: &str) {
        let mut inner = self.inner.lock().await;
        let name = match inner.uploads.get_mut(upload_id) {
            Some(entry) => {
                entry.completed = true;
                entry.file_name.clone()
            }
            None => return,
        };
        inner.reserved.remove(&name);
    }

    /// Aborts and forgets an upload. Returns `false` if it was unknown.
    async fn remove(&self, upload_id: &str, reason: &str) -> bool {
        let entry = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.uploads.remove(upload_id) else {
                return false;
            };
            if !entry.completed {
                inner.reserved.remove(&entry.file_name);
            }
            entry
        };
        if !entry.completed {
            entry.assembler.lock().await.abort(reason).await;
        }
        true
    }

    /// Cancels an upload owned by `link_id`. Idempotent: unknown or
    /// finished uploads are left alone.
    pub async fn cancel(&self, link_id: &str, upload_id: &str, reason: &str) -> bool {
        let owned = {
            let inner = self.inner.lock().await;
            inner
                .uploads
                .get(upload_id)
                .is_some_and(|e| e.link_id == link_id && !e.completed)
        };
        if !owned {
            return false;
        }
        debug!(%upload_id, reason, "upload cancelled");
        self.remove(upload_id, reason).await
    }

    /// Aborts every unfinished upload of a closed link and drops its
    /// finished ones.
    pub async fn release_link(&self, link_id: &str) -> usize {
        let ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .uploads
                .iter()
                .filter(|(_, e)| e.link_id == link_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut aborted = 0;
        for id in ids {
            let unfinished = {
                let inner = self.inner.lock().await;
                inner.uploads.get(&id).is_some_and(|e| !e.completed)
            };
            if self.remove(&id, "link closed").await && unfinished {
                aborted += 1;
            }
        }
        if aborted > 0 {
            info!(link = %link_id, aborted, "aborted uploads of closed link");
        }
        aborted
    }

    /// Drops uploads idle for longer than `idle`. Unfinished ones are
    /// aborted, which discards their partial blob.
    pub async fn collect_idle(&self, idle: Duration) -> usize {
        let candidates: Vec<(String, Arc<Mutex<Assembler>>)> = {
            let inner = self.inner.lock().await;
            inner
                .uploads
                .iter()
                .map(|(id, e)| (id.clone(), e.assembler.clone()))
                .collect()
        };

        let mut collected = 0;
        for (id, assembler) in candidates {
            // An assembler busy writing is not idle.
            let Ok(guard) = assembler.try_lock() else {
                continue;
            };
            let stale = guard.last_activity().elapsed() >= idle;
            drop(guard);
            if stale && self.remove(&id, "upload idle timeout").await {
                debug!(upload_id = %id, "idle upload collected");
                collected += 1;
            }
        }
        collected
    }

    /// Runs [`collect_idle`](Self::collect_idle) every `interval` until
    /// `cancel` fires.
    pub fn spawn_gc(
        &self,
        interval: Duration,
        idle: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let n = registry.collect_idle(idle).await;
                        if n > 0 {
                            info!(collected = n, "upload gc pass");
                        }
                    }
                }
            }
        })
    }

    /// Blob name of a registered upload.
    pub async fn file_name(&self, upload_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.uploads.get(upload_id).map(|e| e.file_name.clone())
    }

    /// Number of registered uploads (finished or not).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.uploads.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
