use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use peershare_protocol::TransferStatus;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::session::total_chunks_for;
use crate::sink::ByteSink;
use crate::TransferError;

/// Most out-of-order chunks held per upload before the sender is refused.
pub const MAX_PENDING_CHUNKS: usize = 64;

/// Result of [`UploadAssembler::accept_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAccepted {
    /// The chunk had already been received; nothing was written.
    pub duplicate: bool,
    /// Present once every chunk was flushed and the sink closed.
    pub completed: Option<UploadSummary>,
}

/// Final accounting of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub size: u64,
    /// Hex SHA-256 of the bytes written, in write order.
    pub checksum: String,
}

/// Host-side reassembly of one upload.
///
/// Chunks may arrive in any order; bytes reach the sink strictly in index
/// order. The upload completes when every index `0..total_chunks` has been
/// flushed. The sender's `is_last` flag is only honoured on the final
/// index.
pub struct UploadAssembler<S> {
    upload_id: String,
    file_name: String,
    file_size: u64,
    chunk_size: u64,
    total_chunks: u64,
    received: HashSet<u64>,
    pending: BTreeMap<u64, Vec<u8>>,
    next_to_flush: u64,
    written: u64,
    hasher: Sha256,
    sink: S,
    status: TransferStatus,
    last_activity: Instant,
}

impl<S: ByteSink> UploadAssembler<S> {
    /// Creates an assembler for `file_size` bytes split into `chunk_size`
    /// chunks. `total_chunks` as announced by the sender must agree.
    pub fn new(
        upload_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        chunk_size: u64,
        total_chunks: u64,
        sink: S,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        let expected = total_chunks_for(file_size, chunk_size);
        if total_chunks != expected {
            return Err(TransferError::ChunkOutOfRange {
                index: total_chunks,
                total: expected,
            });
        }
        Ok(Self {
            upload_id: upload_id.into(),
            file_name: file_name.into(),
            file_size,
            chunk_size,
            total_chunks,
            received: HashSet::new(),
            pending: BTreeMap::new(),
            next_to_flush: 0,
            written: 0,
            hasher: Sha256::new(),
            sink,
            status: TransferStatus::Initializing,
            last_activity: Instant::now(),
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Index of the next chunk the sink is waiting for.
    pub fn next_to_flush(&self) -> u64 {
        self.next_to_flush
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn expected_len(&self, index: u64) -> u64 {
        let start = index * self.chunk_size;
        self.chunk_size.min(self.file_size.saturating_sub(start))
    }

    /// Accepts chunk `index`, flushing every contiguous chunk it unblocks.
    pub async fn accept_chunk(
        &mut self,
        index: u64,
        data: Vec<u8>,
        is_last: bool,
    ) -> Result<ChunkAccepted, TransferError> {
        if self.status == TransferStatus::Completed && self.received.contains(&index) {
            self.last_activity = Instant::now();
            return Ok(ChunkAccepted {
                duplicate: true,
                completed: None,
            });
        }
        if self.status.is_terminal() {
            return Err(TransferError::Cancelled(format!(
                "upload {} is {:?}",
                self.upload_id, self.status
            )));
        }
        if index >= self.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let expected = self.expected_len(index);
        if data.len() as u64 != expected {
            return Err(TransferError::ChunkSizeMismatch {
                index,
                expected,
                got: data.len() as u64,
            });
        }
        if is_last && index + 1 != self.total_chunks {
            debug!(upload_id = %self.upload_id, index, "ignoring early is_last flag");
        }

        self.last_activity = Instant::now();
        if !self.received.insert(index) {
            return Ok(ChunkAccepted {
                duplicate: true,
                completed: None,
            });
        }
        if index != self.next_to_flush && self.pending.len() >= MAX_PENDING_CHUNKS {
            self.received.remove(&index);
            return Err(TransferError::BufferOverflow(MAX_PENDING_CHUNKS));
        }
        if self.status == TransferStatus::Initializing {
            self.status = TransferStatus::Transferring;
        }
        self.pending.insert(index, data);

        while let Some(chunk) = self.pending.remove(&self.next_to_flush) {
            self.sink.ready().await?;
            self.hasher.update(&chunk);
            self.written += chunk.len() as u64;
            self.sink.write(chunk).await?;
            self.next_to_flush += 1;
        }

        let completed = if self.next_to_flush == self.total_chunks {
            Some(self.finish().await?)
        } else {
            None
        };

        Ok(ChunkAccepted {
            duplicate: false,
            completed,
        })
    }

    async fn finish(&mut self) -> Result<UploadSummary, TransferError> {
        self.status = TransferStatus::Assembling;
        self.sink.close().await?;
        self.status = TransferStatus::Completed;
        let checksum = hex::encode(std::mem::take(&mut self.hasher).finalize());
        info!(
            upload_id = %self.upload_id,
            file = %self.file_name,
            size = self.written,
            "upload complete"
        );
        Ok(UploadSummary {
            size: self.written,
            checksum,
        })
    }

    /// Stops the upload and aborts the sink. No-op once terminal.
    pub async fn abort(&mut self, reason: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TransferStatus::Cancelled;
        self.pending.clear();
        self.sink.abort(reason.to_string()).await;
        debug!(upload_id = %self.upload_id, reason, "upload aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{SinkEvent, channel_sink};
    use crate::source::checksum_bytes;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn slice(all: &[u8], index: u64, chunk: u64) -> Vec<u8> {
        let start = (index * chunk) as usize;
        let end = (start + chunk as usize).min(all.len());
        all[start..end].to_vec()
    }

    #[tokio::test]
    async fn out_of_order_chunks_flush_in_order() {
        let all = payload(100);
        let (sink, mut rx) = channel_sink(32);
        let mut asm = UploadAssembler::new("u1", "a.bin", 100, 10, 10, sink).unwrap();

        let order = [0u64, 2, 1, 3, 4, 5, 6, 7, 8, 9];
        let mut done = None;
        for (n, &i) in order.iter().enumerate() {
            let r = asm.accept_chunk(i, slice(&all, i, 10), i == 9).await.unwrap();
            assert!(!r.duplicate);
            if n == 1 {
                // chunk 2 waits for chunk 1
                assert_eq!(asm.next_to_flush(), 1);
            }
            done = r.completed;
        }

        let summary = done.expect("upload should complete");
        assert_eq!(summary.size, 100);
        assert_eq!(summary.checksum, checksum_bytes(&all));
        assert_eq!(asm.status(), TransferStatus::Completed);

        let mut written = Vec::new();
        let mut chunks = 0;
        while let Some(ev) = rx.recv().await {
            match ev {
                SinkEvent::Data(d) => {
                    assert_eq!(d, slice(&all, chunks, 10));
                    chunks += 1;
                    written.extend(d);
                }
                SinkEvent::End => break,
                SinkEvent::Error(e) => panic!("unexpected abort: {e}"),
            }
        }
        assert_eq!(chunks, 10);
        assert_eq!(written, all);
    }

    #[tokio::test]
    async fn duplicates_do_not_count() {
        let all = payload(20);
        let (sink, _rx) = channel_sink(8);
        let mut asm = UploadAssembler::new("u", "f", 20, 10, 2, sink).unwrap();

        assert!(!asm.accept_chunk(0, slice(&all, 0, 10), false).await.unwrap().duplicate);
        let dup = asm.accept_chunk(0, slice(&all, 0, 10), false).await.unwrap();
        assert!(dup.duplicate);
        assert!(dup.completed.is_none());
        assert_eq!(asm.bytes_written(), 10);

        let last = asm.accept_chunk(1, slice(&all, 1, 10), true).await.unwrap();
        assert!(last.completed.is_some());
    }

    #[tokio::test]
    async fn resent_chunk_after_completion_is_a_duplicate() {
        let all = payload(20);
        let (sink, _rx) = channel_sink(8);
        let mut asm = UploadAssembler::new("u", "f", 20, 10, 2, sink).unwrap();

        asm.accept_chunk(0, slice(&all, 0, 10), false).await.unwrap();
        let done = asm.accept_chunk(1, slice(&all, 1, 10), true).await.unwrap();
        assert!(done.completed.is_some());

        let again = asm.accept_chunk(1, slice(&all, 1, 10), true).await.unwrap();
        assert!(again.duplicate);
        assert!(again.completed.is_none());
        assert_eq!(asm.bytes_written(), 20);
        assert_eq!(asm.status(), TransferStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_upload_refuses_chunks() {
        let all = payload(20);
        let (sink, _rx) = channel_sink(8);
        let mut asm = UploadAssembler::new("u", "f", 20, 10, 2, sink).unwrap();

        asm.accept_chunk(0, slice(&all, 0, 10), false).await.unwrap();
        asm.abort("user cancelled").await;
        assert!(matches!(
            asm.accept_chunk(0, slice(&all, 0, 10), false).await,
            Err(TransferError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn early_last_flag_does_not_complete() {
        let all = payload(30);
        let (sink, _rx) = channel_sink(8);
        let mut asm = UploadAssembler::new("u", "f", 30, 10, 3, sink).unwrap();

        let r = asm.accept_chunk(0, slice(&all, 0, 10), true).await.unwrap();
        assert!(r.completed.is_none());
        assert_eq!(asm.status(), TransferStatus::Transferring);
    }

    #[tokio::test]
    async fn rejects_out_of_range_and_wrong_size() {
        let (sink, _rx) = channel_sink(8);
        let mut asm = UploadAssembler::new("u", "f", 25, 10, 3, sink).unwrap();
        assert!(matches!(
            asm.accept_chunk(3, vec![0; 5], true).await,
            Err(TransferError::ChunkOutOfRange { index: 3, total: 3 })
        ));
        assert!(matches!(
            asm.accept_chunk(2, vec![0; 10], true).await,
            Err(TransferError::ChunkSizeMismatch { index: 2, expected: 5, got: 10 })
        ));
    }

    #[test]
    fn rejects_inconsistent_total() {
        let (sink, _rx) = channel_sink(1);
        assert!(UploadAssembler::new("u", "f", 25, 10, 2, sink).is_err());
    }

    #[tokio::test]
    async fn zero_byte_upload() {
        let (sink, rx) = channel_sink(2);
        let mut asm = UploadAssembler::new("u", "empty", 0, 10, 1, sink).unwrap();
        let r = asm.accept_chunk(0, Vec::new(), true).await.unwrap();
        assert_eq!(r.completed.unwrap().size, 0);
        assert_eq!(rx.read_to_end().await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn abort_is_terminal() {
        let (sink, mut rx) = channel_sink(4);
        let mut asm = UploadAssembler::new("u", "f", 20, 10, 2, sink).unwrap();
        asm.accept_chunk(1, vec![0; 10], true).await.unwrap();
        asm.abort("peer left").await;
        assert_eq!(asm.status(), TransferStatus::Cancelled);
        assert_eq!(rx.recv().await, Some(SinkEvent::Error("peer left".into())));
        assert!(asm.accept_chunk(0, vec![0; 10], false).await.is_err());
    }
}
