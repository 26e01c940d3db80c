use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use peershare_protocol::messages::FileChunk;
use peershare_protocol::{TransferProgress, TransferStatus};
use tracing::{debug, warn};

use crate::progress::ProgressMeter;
use crate::session::FileTransferSession;
use crate::sink::ByteSink;
use crate::TransferError;

/// Boxed future returned by [`ChunkProcessor`] methods.
pub type ProcessorFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Consumes the chunks of one download.
///
/// The driver feeds every received chunk to
/// [`process_chunk`](ChunkProcessor::process_chunk), which returns the next
/// index to request (or `None` when nothing is outstanding). Once
/// [`should_complete`](ChunkProcessor::should_complete) says so, the driver
/// calls [`complete`](ChunkProcessor::complete); an
/// [`Incomplete`](TransferError::Incomplete) error lists chunks to fetch
/// before trying again.
pub trait ChunkProcessor: Send {
    fn session(&self) -> &FileTransferSession;

    fn process_chunk(
        &mut self,
        chunk: FileChunk,
    ) -> ProcessorFuture<'_, Result<Option<u64>, TransferError>>;

    /// Whether the driver should attempt completion after chunk
    /// `chunk_index` was processed.
    fn should_complete(&self, chunk_index: u64, is_last: bool) -> bool;

    /// Finishes the transfer. Buffered processors return the assembled
    /// bytes; streaming processors close their sink and return `None`.
    fn complete(&mut self) -> ProcessorFuture<'_, Result<Option<Vec<u8>>, TransferError>>;

    /// Abandons the transfer. No-op once terminal.
    fn cancel(&mut self, reason: String) -> ProcessorFuture<'_, ()>;

    fn progress(&self) -> TransferProgress;

    fn status(&self) -> TransferStatus;

    /// Whether another chunk may be requested. Checked by the driver
    /// before every chunk request.
    fn wants_more(&self) -> bool {
        !self.status().is_terminal()
    }
}

fn check_chunk(session: &FileTransferSession, chunk: &FileChunk) -> Result<(), TransferError> {
    if chunk.file_id != session.file_id {
        return Err(TransferError::WrongTransfer {
            expected: session.file_id.clone(),
            got: chunk.file_id.clone(),
        });
    }
    let expected = session.chunk_len(chunk.chunk_index)?;
    let got = chunk.data.len() as u64;
    if got != expected {
        return Err(TransferError::ChunkSizeMismatch {
            index: chunk.chunk_index,
            expected,
            got,
        });
    }
    Ok(())
}

fn advance(status: &mut TransferStatus, next: TransferStatus) {
    if status.can_advance_to(next) {
        *status = next;
    }
}

/// Collects every chunk in memory and assembles the file on completion.
pub struct BufferedProcessor {
    session: FileTransferSession,
    chunks: BTreeMap<u64, Vec<u8>>,
    meter: ProgressMeter,
    status: TransferStatus,
}

impl BufferedProcessor {
    pub fn new(session: FileTransferSession) -> Self {
        let meter = ProgressMeter::new(session.range_len(), session.total_chunks);
        Self {
            session,
            chunks: BTreeMap::new(),
            meter,
            status: TransferStatus::Initializing,
        }
    }

    /// Indexes not yet received, ascending.
    pub fn missing(&self) -> Vec<u64> {
        (0..self.session.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    fn accept(&mut self, chunk: FileChunk) -> Result<Option<u64>, TransferError> {
        if self.status.is_terminal() {
            return Err(TransferError::Cancelled(format!("transfer is {:?}", self.status)));
        }
        if let Err(e) = check_chunk(&self.session, &chunk) {
            self.status = TransferStatus::Error;
            return Err(e);
        }
        advance(&mut self.status, TransferStatus::Transferring);

        let index = chunk.chunk_index;
        if self.chunks.contains_key(&index) {
            debug!(file_id = %self.session.file_id, index, "duplicate chunk ignored");
        } else {
            self.meter.record(chunk.data.len() as u64);
            self.chunks.insert(index, chunk.data);
        }

        Ok(self.missing().first().copied())
    }

    fn assemble(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        if self.status == TransferStatus::Completed {
            return Ok(None);
        }
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(TransferError::Incomplete { missing });
        }
        advance(&mut self.status, TransferStatus::Assembling);

        let mut data = Vec::with_capacity(self.session.range_len() as usize);
        for chunk in std::mem::take(&mut self.chunks).into_values() {
            data.extend_from_slice(&chunk);
        }
        advance(&mut self.status, TransferStatus::Completed);
        Ok(Some(data))
    }
}

impl ChunkProcessor for BufferedProcessor {
    fn session(&self) -> &FileTransferSession {
        &self.session
    }

    fn process_chunk(
        &mut self,
        chunk: FileChunk,
    ) -> ProcessorFuture<'_, Result<Option<u64>, TransferError>> {
        let result = self.accept(chunk);
        Box::pin(async move { result })
    }

    fn should_complete(&self, _chunk_index: u64, is_last: bool) -> bool {
        is_last || self.chunks.len() as u64 == self.session.total_chunks
    }

    fn complete(&mut self) -> ProcessorFuture<'_, Result<Option<Vec<u8>>, TransferError>> {
        let result = self.assemble();
        Box::pin(async move { result })
    }

    fn cancel(&mut self, _reason: String) -> ProcessorFuture<'_, ()> {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Cancelled;
            self.chunks.clear();
        }
        Box::pin(async {})
    }

    fn progress(&self) -> TransferProgress {
        self.meter.snapshot(self.status)
    }

    fn status(&self) -> TransferStatus {
        self.status
    }
}

/// Writes chunks to a [`ByteSink`] strictly in index order, holding early
/// arrivals in a bounded buffer.
pub struct StreamingProcessor<S> {
    session: FileTransferSession,
    sink: S,
    buffer: BTreeMap<u64, Vec<u8>>,
    next_index: u64,
    max_buffered: usize,
    meter: ProgressMeter,
    status: TransferStatus,
}

impl<S: ByteSink> StreamingProcessor<S> {
    pub fn new(session: FileTransferSession, sink: S, max_buffered: usize) -> Self {
        let meter = ProgressMeter::new(session.range_len(), session.total_chunks);
        Self {
            session,
            sink,
            buffer: BTreeMap::new(),
            next_index: 0,
            max_buffered: max_buffered.max(1),
            meter,
            status: TransferStatus::Initializing,
        }
    }

    /// Index of the next chunk the sink is waiting for.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn missing(&self) -> Vec<u64> {
        (self.next_index..self.session.total_chunks)
            .filter(|i| !self.buffer.contains_key(i))
            .collect()
    }

    async fn fail(&mut self, err: TransferError) -> TransferError {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Error;
            self.buffer.clear();
            self.sink.abort(err.to_string()).await;
        }
        err
    }

    async fn accept(&mut self, chunk: FileChunk) -> Result<Option<u64>, TransferError> {
        if self.status.is_terminal() {
            return Err(TransferError::Cancelled(format!("transfer is {:?}", self.status)));
        }
        if let Err(e) = check_chunk(&self.session, &chunk) {
            return Err(self.fail(e).await);
        }
        if !self.sink.is_accepting() {
            return Err(self.fail(TransferError::SinkAborted("sink stopped accepting".into())).await);
        }
        advance(&mut self.status, TransferStatus::Transferring);

        let index = chunk.chunk_index;
        if index < self.next_index || self.buffer.contains_key(&index) {
            debug!(file_id = %self.session.file_id, index, "duplicate chunk ignored");
        } else if index != self.next_index && self.buffer.len() >= self.max_buffered {
            warn!(file_id = %self.session.file_id, index, "out-of-order buffer full");
            return Err(self.fail(TransferError::BufferOverflow(self.max_buffered)).await);
        } else {
            self.buffer.insert(index, chunk.data);
        }

        while let Some(data) = self.buffer.remove(&self.next_index) {
            let len = data.len() as u64;
            let written = match self.sink.ready().await {
                Ok(()) => self.sink.write(data).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                return Err(self.fail(e).await);
            }
            self.meter.record(len);
            self.next_index += 1;
        }

        let next = self.missing().first().copied();
        if next.is_some() && !self.sink.is_accepting() {
            return Err(self.fail(TransferError::SinkAborted("sink stopped accepting".into())).await);
        }
        Ok(next)
    }

    async fn finish(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        if self.status == TransferStatus::Completed {
            return Ok(None);
        }
        if self.status.is_terminal() {
            return Err(TransferError::Cancelled(format!("transfer is {:?}", self.status)));
        }
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(TransferError::Incomplete { missing });
        }
        advance(&mut self.status, TransferStatus::Assembling);
        if let Err(e) = self.sink.close().await {
            return Err(self.fail(e).await);
        }
        advance(&mut self.status, TransferStatus::Completed);
        Ok(None)
    }
}

impl<S: ByteSink> ChunkProcessor for StreamingProcessor<S> {
    fn session(&self) -> &FileTransferSession {
        &self.session
    }

    fn process_chunk(
        &mut self,
        chunk: FileChunk,
    ) -> ProcessorFuture<'_, Result<Option<u64>, TransferError>> {
        Box::pin(self.accept(chunk))
    }

    fn should_complete(&self, _chunk_index: u64, is_last: bool) -> bool {
        is_last || self.next_index == self.session.total_chunks
    }

    fn complete(&mut self) -> ProcessorFuture<'_, Result<Option<Vec<u8>>, TransferError>> {
        Box::pin(self.finish())
    }

    fn cancel(&mut self, reason: String) -> ProcessorFuture<'_, ()> {
        Box::pin(async move {
            if self.status.is_terminal() {
                return;
            }
            self.status = TransferStatus::Cancelled;
            self.buffer.clear();
            self.sink.abort(reason).await;
        })
    }

    fn progress(&self) -> TransferProgress {
        self.meter.snapshot(self.status)
    }

    fn status(&self) -> TransferStatus {
        self.status
    }

    fn wants_more(&self) -> bool {
        !self.status.is_terminal() && self.sink.is_accepting()
    }
}
