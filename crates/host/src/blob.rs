//! Storage for completed uploads.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use peershare_transfer::{ByteSink, SinkFuture, TransferError, validate_upload_name};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Boxed future returned by [`BlobStore`] methods.
pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Destination for uploaded files.
///
/// A writer becomes visible under its name only once closed; aborting it
/// leaves nothing behind.
pub trait BlobStore: Send + Sync {
    fn create_writer<'a>(
        &'a self,
        name: &'a str,
        mime_type: &'a str,
        size: Option<u64>,
    ) -> BlobFuture<'a, Box<dyn ByteSink>>;

    fn get_file<'a>(&'a self, name: &'a str) -> BlobFuture<'a, Option<Vec<u8>>>;

    fn delete_file<'a>(&'a self, name: &'a str) -> BlobFuture<'a, bool>;
}

// ---------------------------------------------------------------------------
// Directory store
// ---------------------------------------------------------------------------

/// Stores blobs as files in one directory. Writes go to `<name>.part` and
/// are renamed into place on close.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    dir: PathBuf,
}

impl DirBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, TransferError> {
        validate_upload_name(name)?;
        Ok(self.dir.join(name))
    }
}

impl BlobStore for DirBlobStore {
    fn create_writer<'a>(
        &'a self,
        name: &'a str,
        _mime_type: &'a str,
        _size: Option<u64>,
    ) -> BlobFuture<'a, Box<dyn ByteSink>> {
        Box::pin(async move {
            let target = self.path_for(name)?;
            tokio::fs::create_dir_all(&self.dir).await?;
            let part = self.dir.join(format!("{name}.part"));
            let file = tokio::fs::File::create(&part).await?;
            debug!(path = %part.display(), "blob writer opened");
            Ok(Box::new(FileBlobWriter {
                file: Some(file),
                part,
                target,
            }) as Box<dyn ByteSink>)
        })
    }

    fn get_file<'a>(&'a self, name: &'a str) -> BlobFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn delete_file<'a>(&'a self, name: &'a str) -> BlobFuture<'a, bool> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }
}

struct FileBlobWriter {
    file: Option<tokio::fs::File>,
    part: PathBuf,
    target: PathBuf,
}

impl ByteSink for FileBlobWriter {
    fn ready(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        let result = if self.file.is_some() {
            Ok(())
        } else {
            Err(TransferError::SinkClosed)
        };
        Box::pin(async move { result })
    }

    fn write(&mut self, data: Vec<u8>) -> SinkFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let file = self.file.as_mut().ok_or(TransferError::SinkClosed)?;
            file.write_all(&data).await?;
            Ok(())
        })
    }

    fn close(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let mut file = self.file.take().ok_or(TransferError::SinkClosed)?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&self.part, &self.target).await?;
            Ok(())
        })
    }

    fn abort(&mut self, reason: String) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            if self.file.take().is_none() {
                return;
            }
            if let Err(e) = tokio::fs::remove_file(&self.part).await {
                warn!(path = %self.part.display(), "failed to remove partial blob: {e}");
            }
            debug!(path = %self.part.display(), %reason, "blob writer aborted");
        })
    }

    fn is_accepting(&self) -> bool {
        self.file.is_some()
    }
}

// ---------------------------------------------------------------------------
// Memory store
// ---------------------------------------------------------------------------

/// One write observed by a [`MemoryBlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub name: String,
    pub len: usize,
    /// First byte of the write, if any.
    pub first_byte: Option<u8>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    files: HashMap<String, Vec<u8>>,
    writes: Vec<WriteRecord>,
}

/// In-memory [`BlobStore`] that also records every write in order.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes observed so far, across all blobs, in order.
    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().await.writes.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.lock().await.files.keys().cloned().collect();
        names.sort();
        names
    }
}

impl BlobStore for MemoryBlobStore {
    fn create_writer<'a>(
        &'a self,
        name: &'a str,
        _mime_type: &'a str,
        size: Option<u64>,
    ) -> BlobFuture<'a, Box<dyn ByteSink>> {
        Box::pin(async move {
            validate_upload_name(name)?;
            Ok(Box::new(MemoryBlobWriter {
                name: name.to_string(),
                buf: Vec::with_capacity(size.unwrap_or(0).min(1 << 20) as usize),
                store: self.inner.clone(),
                open: true,
            }) as Box<dyn ByteSink>)
        })
    }

    fn get_file<'a>(&'a self, name: &'a str) -> BlobFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { Ok(self.inner.lock().await.files.get(name).cloned()) })
    }

    fn delete_file<'a>(&'a self, name: &'a str) -> BlobFuture<'a, bool> {
        Box::pin(async move { Ok(self.inner.lock().await.files.remove(name).is_some()) })
    }
}

struct MemoryBlobWriter {
    name: String,
    buf: Vec<u8>,
    store: Arc<Mutex<MemoryInner>>,
    open: bool,
}

impl ByteSink for MemoryBlobWriter {
    fn ready(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        let result = if self.open {
            Ok(())
        } else {
            Err(TransferError::SinkClosed)
        };
        Box::pin(async move { result })
    }

    fn write(&mut self, data: Vec<u8>) -> SinkFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            if !self.open {
                return Err(TransferError::SinkClosed);
            }
            self.store.lock().await.writes.push(WriteRecord {
                name: self.name.clone(),
                len: data.len(),
                first_byte: data.first().copied(),
            });
            self.buf.extend_from_slice(&data);
            Ok(())
        })
    }

    fn close(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            if !self.open {
                return Err(TransferError::SinkClosed);
            }
            self.open = false;
            let data = std::mem::take(&mut self.buf);
            self.store.lock().await.files.insert(self.name.clone(), data);
            Ok(())
        })
    }

    fn abort(&mut self, _reason: String) -> SinkFuture<'_, ()> {
        self.open = false;
        self.buf.clear();
        Box::pin(async {})
    }

    fn is_accepting(&self) -> bool {
        self.open
    }
}
