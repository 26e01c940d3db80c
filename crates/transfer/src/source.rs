use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::sink::SinkFuture;
use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 over chunks fed in index order.
///
/// Re-reads of an index that was already hashed (retries) are ignored, so
/// the digest stays equal to a hash of the whole file.
#[derive(Debug, Default)]
pub struct OrderedDigest {
    next: u64,
    hasher: Sha256,
}

impl OrderedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes chunk `index` if it is the next one in sequence.
    pub fn update(&mut self, index: u64, data: &[u8]) {
        if index == self.next {
            self.hasher.update(data);
            self.next += 1;
        }
    }

    /// Number of chunks hashed so far.
    pub fn chunks(&self) -> u64 {
        self.next
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Guesses a MIME type from a file extension.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt" | "log" | "md") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("js") => "text/javascript",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Upload sources
// ---------------------------------------------------------------------------

/// Random-access bytes to upload.
pub trait UploadSource: Send + Sync {
    fn name(&self) -> &str;

    fn mime_type(&self) -> &str;

    fn size(&self) -> u64;

    /// Reads `start..end`.
    fn read_range(&self, start: u64, end: u64) -> SinkFuture<'_, Result<Vec<u8>, TransferError>>;
}

fn check_range(start: u64, end: u64, size: u64) -> Result<(), TransferError> {
    if start > end || end > size {
        return Err(TransferError::InvalidRange { start, end, size });
    }
    Ok(())
}

/// In-memory upload source.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    mime_type: String,
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let name = name.into();
        let mime_type = mime_for_name(&name).to_string();
        Self {
            name,
            mime_type,
            data: data.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

impl UploadSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> SinkFuture<'_, Result<Vec<u8>, TransferError>> {
        let result = check_range(start, end, self.size())
            .map(|()| self.data[start as usize..end as usize].to_vec());
        Box::pin(async move { result })
    }
}

/// Upload source backed by a file on disk. Each read opens its own handle
/// so concurrent reads never share a cursor.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
    name: String,
    mime_type: String,
    size: u64,
}

impl LocalFileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(TransferError::InvalidPath(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidPath(path.display().to_string()))?
            .to_string();
        let mime_type = mime_for_name(&name).to_string();
        Ok(Self {
            path,
            name,
            mime_type,
            size: meta.len(),
        })
    }
}

impl UploadSource for LocalFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&self, start: u64, end: u64) -> SinkFuture<'_, Result<Vec<u8>, TransferError>> {
        Box::pin(async move {
            check_range(start, end, self.size)?;
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checksum_bytes_deterministic() {
        let a = checksum_bytes(b"hello world");
        assert_eq!(a, checksum_bytes(b"hello world"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, checksum_bytes(b"hello world!"));
    }

    #[test]
    fn ordered_digest_matches_whole_hash_despite_rereads() {
        let mut d = OrderedDigest::new();
        d.update(0, b"abc");
        d.update(0, b"abc");
        d.update(2, b"ghi");
        d.update(1, b"def");
        d.update(2, b"ghi");
        assert_eq!(d.chunks(), 3);
        assert_eq!(d.finalize(), checksum_bytes(b"abcdefghi"));
    }

    #[test]
    fn mime_guess() {
        assert_eq!(mime_for_name("notes.TXT"), "text/plain");
        assert_eq!(mime_for_name("photo.jpeg"), "image/jpeg");
        assert_eq!(mime_for_name("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn memory_source_reads_ranges() {
        let src = MemorySource::new("a.txt", b"0123456789".to_vec());
        assert_eq!(src.mime_type(), "text/plain");
        assert_eq!(src.read_range(2, 5).await.unwrap(), b"234");
        assert!(src.read_range(5, 11).await.is_err());
    }

    #[tokio::test]
    async fn local_file_source_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abcdefghij").unwrap();

        let src = LocalFileSource::open(&path).await.unwrap();
        assert_eq!(src.name(), "data.bin");
        assert_eq!(src.size(), 10);
        assert_eq!(src.read_range(7, 10).await.unwrap(), b"hij");
        assert_eq!(src.read_range(10, 10).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn local_file_source_rejects_directories() {
        let dir = TempDir::new().unwrap();
        assert!(LocalFileSource::open(dir.path()).await.is_err());
    }
}
