//! Read-only access to the shared directory.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use peershare_protocol::FileEntry;
use peershare_transfer::{mime_for_name, normalize_shared_path};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Boxed future returned by [`FileSystem`] methods.
pub type FsFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FsError>> + Send + 'a>>;

/// Errors from a [`FileSystem`].
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("range {start}..{end} outside {size}-byte file")]
    OutOfRange { start: u64, end: u64, size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of one shared file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Milliseconds since the Unix epoch.
    pub modified_at: Option<i64>,
}

/// Read-only view of the shared tree. Paths are wire paths (`/`, `/a/b.txt`).
pub trait FileSystem: Send + Sync {
    fn list_directory<'a>(&'a self, path: &'a str) -> FsFuture<'a, Vec<FileEntry>>;

    fn stat_file<'a>(&'a self, path: &'a str) -> FsFuture<'a, FileStat>;

    /// Reads `start..end`.
    fn read_range<'a>(&'a self, path: &'a str, start: u64, end: u64) -> FsFuture<'a, Vec<u8>>;
}

/// [`FileSystem`] rooted at a local directory.
///
/// Requests cannot leave the root, through `..` or through symlinks.
/// Dot-files are hidden from listings.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, FsError> {
        let root = std::fs::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(FsError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, wire_path: &str) -> Result<PathBuf, FsError> {
        let rel = normalize_shared_path(wire_path)
            .map_err(|e| FsError::InvalidPath(e.to_string()))?;
        let full = self.root.join(rel);
        let real = match tokio::fs::canonicalize(&full).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(wire_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !real.starts_with(&self.root) {
            return Err(FsError::InvalidPath(wire_path.to_string()));
        }
        Ok(real)
    }
}

fn millis(time: std::io::Result<SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

fn join_wire(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        format!("/{name}")
    } else if base.starts_with('/') {
        format!("{base}/{name}")
    } else {
        format!("/{base}/{name}")
    }
}

impl FileSystem for LocalFileSystem {
    fn list_directory<'a>(&'a self, path: &'a str) -> FsFuture<'a, Vec<FileEntry>> {
        Box::pin(async move {
            let dir = self.resolve(path).await?;
            if !tokio::fs::metadata(&dir).await?.is_dir() {
                return Err(FsError::NotADirectory(path.to_string()));
            }

            let mut entries = Vec::new();
            let mut rd = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = rd.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                // Follow symlinks, skipping dangling ones.
                let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
                    continue;
                };
                let is_directory = meta.is_dir();
                entries.push(FileEntry {
                    path: join_wire(path, &name),
                    is_directory,
                    size: (!is_directory).then_some(meta.len()),
                    mime_type: (!is_directory).then(|| mime_for_name(&name).to_string()),
                    modified_at: millis(meta.modified()),
                    name,
                });
            }

            entries.sort_by(|a, b| {
                b.is_directory
                    .cmp(&a.is_directory)
                    .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            });
            Ok(entries)
        })
    }

    fn stat_file<'a>(&'a self, path: &'a str) -> FsFuture<'a, FileStat> {
        Box::pin(async move {
            let full = self.resolve(path).await?;
            let meta = tokio::fs::metadata(&full).await?;
            if !meta.is_file() {
                return Err(FsError::NotAFile(path.to_string()));
            }
            let name = full
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(FileStat {
                mime_type: mime_for_name(&name).to_string(),
                size: meta.len(),
                modified_at: millis(meta.modified()),
                name,
            })
        })
    }

    fn read_range<'a>(&'a self, path: &'a str, start: u64, end: u64) -> FsFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let full = self.resolve(path).await?;
            let mut file = tokio::fs::File::open(&full).await?;
            let size = file.metadata().await?.len();
            if start > end || end > size {
                return Err(FsError::OutOfRange { start, end, size });
            }
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

    fn tree() -> (TempDir, LocalFileSystem) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.md"), b"# hi").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bbb").unwrap();
        std::fs::write(dir.path().join("A.png"), b"png").unwrap();
        std::fs::write(dir.path().join(".secret"), b"x").unwrap();
        let fs = LocalFileSystem::new(dir.path()).unwrap();
        (dir, fs)
    }

    #[tokio::test]
    async fn lists_directories_first_without_dotfiles() {
        let (_dir, fs) = tree();
        let entries = fs.list_directory("/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "A.png", "b.txt"]);

        assert!(entries[0].is_directory);
        assert_eq!(entries[0].path, "/docs");
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[1].mime_type.as_deref(), Some("image/png"));
        assert_eq!(entries[2].size, Some(3));
    }

    #[tokio::test]
    async fn nested_listing_uses_wire_paths() {
        let (_dir, fs) = tree();
        let entries = fs.list_directory("/docs").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/docs/readme.md");
    }

    #[tokio::test]
    async fn stat_and_read_range() {
        let (_dir, fs) = tree();
        let stat = fs.stat_file("/docs/readme.md").await.unwrap();
        assert_eq!(stat.name, "readme.md");
        assert_eq!(stat.size, 4);
        assert_eq!(stat.mime_type, "text/plain");
        assert!(stat.modified_at.is_some());

        assert_eq!(fs.read_range("/docs/readme.md", 2, 4).await.unwrap(), b"hi");
        assert!(matches!(
            fs.read_range("/docs/readme.md", 2, 9).await,
            Err(FsError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn errors_are_classified() {
        let (_dir, fs) = tree();
        assert!(matches!(fs.stat_file("/missing").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.stat_file("/docs").await, Err(FsError::NotAFile(_))));
        assert!(matches!(
            fs.list_directory("/b.txt").await,
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.list_directory("/../").await,
            Err(FsError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("loot.txt"), b"x").unwrap();
        let (dir, fs) = tree();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        assert!(matches!(
            fs.stat_file("/link/loot.txt").await,
            Err(FsError::InvalidPath(_))
        ));
    }
}
