use peershare_protocol::messages::FileTransferResponse;
use peershare_protocol::constants::MAX_CHUNK_SIZE;

use crate::TransferError;

/// Number of chunks needed for `len` bytes. Never zero: an empty range is
/// still sent as one empty chunk.
pub fn total_chunks_for(len: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 1;
    }
    len.div_ceil(chunk_size).max(1)
}

/// Metadata of one download, fixed when the host answers
/// FILE_TRANSFER_REQUEST.
///
/// The range is half-open: `range_start..range_end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferSession {
    pub file_id: String,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub range_start: u64,
    pub range_end: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl FileTransferSession {
    /// Plans a transfer of `range_start..range_end` within a file of
    /// `total_size` bytes. `None` bounds default to the whole file.
    #[allow(clippy::too_many_arguments)]
    pub fn plan(
        file_id: impl Into<String>,
        path: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        total_size: u64,
        range_start: Option<u64>,
        range_end: Option<u64>,
        chunk_size: u64,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        let start = range_start.unwrap_or(0);
        let end = range_end.unwrap_or(total_size);
        if start > end || end > total_size {
            return Err(TransferError::InvalidRange {
                start,
                end,
                size: total_size,
            });
        }

        Ok(Self {
            file_id: file_id.into(),
            path: path.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            total_size,
            range_start: start,
            range_end: end,
            chunk_size,
            total_chunks: total_chunks_for(end - start, chunk_size),
        })
    }

    /// Rebuilds the session from the host's response, checking that the
    /// advertised geometry is self-consistent.
    pub fn from_response(resp: &FileTransferResponse) -> Result<Self, TransferError> {
        let session = Self::plan(
            resp.file_id.clone(),
            resp.path.clone(),
            resp.name.clone(),
            resp.mime_type.clone(),
            resp.total_size,
            Some(resp.range_start),
            Some(resp.range_end),
            resp.chunk_size,
        )?;
        if session.total_chunks != resp.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                index: resp.total_chunks,
                total: session.total_chunks,
            });
        }
        Ok(session)
    }

    /// Bytes covered by the range.
    pub fn range_len(&self) -> u64 {
        self.range_end - self.range_start
    }

    /// Absolute byte range `start..end` of chunk `index`.
    pub fn chunk_range(&self, index: u64) -> Result<(u64, u64), TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let start = self.range_start + index * self.chunk_size;
        let end = start.saturating_add(self.chunk_size).min(self.range_end);
        Ok((start, end))
    }

    /// Expected length of chunk `index`.
    pub fn chunk_len(&self, index: u64) -> Result<u64, TransferError> {
        let (start, end) = self.chunk_range(index)?;
        Ok(end - start)
    }

    pub fn is_last(&self, index: u64) -> bool {
        index + 1 == self.total_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;

    fn session(size: u64, chunk: u64) -> FileTransferSession {
        FileTransferSession::plan("f1", "/a.bin", "a.bin", "application/octet-stream", size, None, None, chunk)
            .unwrap()
    }

    #[test]
    fn chunk_range_near_end_of_address_space() {
        let s = FileTransferSession::plan(
            "f1",
            "/huge",
            "huge",
            "",
            u64::MAX,
            Some(u64::MAX - 10),
            None,
            8,
        )
        .unwrap();
        assert_eq!(s.total_chunks, 2);
        assert_eq!(s.chunk_range(1).unwrap(), (u64::MAX - 2, u64::MAX));
        assert_eq!(s.chunk_len(1).unwrap(), 2);
    }

    #[test]
    fn chunk_count() {
        assert_eq!(total_chunks_for(0, 512 * KIB), 1);
        assert_eq!(total_chunks_for(1, 512 * KIB), 1);
        assert_eq!(total_chunks_for(512 * KIB, 512 * KIB), 1);
        assert_eq!(total_chunks_for(512 * KIB + 1, 512 * KIB), 2);
        assert_eq!(total_chunks_for(1536 * KIB, 512 * KIB), 3);
    }

    #[test]
    fn chunk_ranges_cover_file() {
        let s = session(1536 * KIB, 512 * KIB);
        assert_eq!(s.total_chunks, 3);
        assert_eq!(s.chunk_range(0).unwrap(), (0, 512 * KIB));
        assert_eq!(s.chunk_range(2).unwrap(), (1024 * KIB, 1536 * KIB));
        assert!(s.chunk_range(3).is_err());
        assert!(s.is_last(2));
    }

    #[test]
    fn short_tail_chunk() {
        let s = session(1000, 300);
        assert_eq!(s.total_chunks, 4);
        assert_eq!(s.chunk_len(3).unwrap(), 100);
    }

    #[test]
    fn partial_range() {
        let s = FileTransferSession::plan("f", "/x", "x", "text/plain", 1000, Some(100), Some(350), 100)
            .unwrap();
        assert_eq!(s.total_chunks, 3);
        assert_eq!(s.chunk_range(0).unwrap(), (100, 200));
        assert_eq!(s.chunk_range(2).unwrap(), (300, 350));
    }

    #[test]
    fn empty_file_has_one_empty_chunk() {
        let s = session(0, 512 * KIB);
        assert_eq!(s.total_chunks, 1);
        assert_eq!(s.chunk_len(0).unwrap(), 0);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(matches!(
            FileTransferSession::plan("f", "/x", "x", "", 10, Some(5), Some(20), 4),
            Err(TransferError::InvalidRange { .. })
        ));
        assert!(matches!(
            FileTransferSession::plan("f", "/x", "x", "", 10, None, None, 0),
            Err(TransferError::InvalidChunkSize(0))
        ));
    }
}
