//! Downloads: open a transfer, pull its chunks in order and feed them to a
//! [`ChunkProcessor`].
//!
//! Chunk 0 arrives inside `FILE_TRANSFER_RESPONSE`; every further chunk is
//! requested with `FILE_CHUNK_REQUEST`. When the processor reports missing
//! chunks at completion they are re-requested, up to
//! [`ClientConfig::max_missing_retries`](crate::ClientConfig) rounds. The
//! host is told the transfer is over with `FILE_TRANSFER_CANCEL` either
//! way: reason `"complete"` on success, the error otherwise.

use std::ops::Range;

use peershare_protocol::messages::{
    FileChunk, FileChunkRequest, FileTransferCancel, FileTransferRequest, FileTransferResponse,
};
use peershare_protocol::{MessageType, TransferProgress};
use peershare_transfer::{
    BufferedProcessor, ByteSink, ChunkProcessor, FileTransferSession, SinkEvent, SinkReceiver,
    StreamingProcessor, TransferError, channel_sink,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ClientError;
use crate::client::{ClientInner, PeerClient};

/// Reason sent with `FILE_TRANSFER_CANCEL` after a successful download.
const REASON_COMPLETE: &str = "complete";

impl PeerClient {
    /// Downloads a whole file into memory.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        self.download_buffered(path, None).await
    }

    /// Downloads `range` (half-open) of a file into memory.
    pub async fn download_range(
        &self,
        path: &str,
        range: Range<u64>,
    ) -> Result<Vec<u8>, ClientError> {
        self.download_buffered(path, Some(range)).await
    }

    /// Streams a file (or `range` of it) into `sink` in byte order.
    ///
    /// The sink's backpressure paces the chunk requests. Returns the
    /// transfer metadata once the sink has been closed.
    pub async fn download_to_sink<S: ByteSink>(
        &self,
        path: &str,
        range: Option<Range<u64>>,
        sink: S,
    ) -> Result<FileTransferSession, ClientError> {
        let (session, first) = open_transfer(&self.inner, path, range).await?;
        let max_buffered = self.inner.config.max_buffered_chunks;
        let mut processor = StreamingProcessor::new(session.clone(), sink, max_buffered);
        let cancel = self.inner.cancel_token().child_token();
        run_to_end(&self.inner, &mut processor, first, &cancel).await?;
        Ok(session)
    }

    /// Opens a streaming download and returns as soon as the host has
    /// accepted it. Bytes are read from the returned [`StreamSession`].
    pub async fn begin_session(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<StreamSession, ClientError> {
        let (session, first) = open_transfer(&self.inner, path, range).await?;
        let (sink, receiver) = channel_sink(self.inner.config.max_buffered_chunks);
        let mut processor = StreamingProcessor::new(
            session.clone(),
            sink,
            self.inner.config.max_buffered_chunks,
        );
        let cancel = self.inner.cancel_token().child_token();

        let task = {
            let client = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_to_end(&client.inner, &mut processor, first, &cancel).await?;
                Ok(processor.progress())
            })
        };

        Ok(StreamSession {
            session,
            receiver,
            cancel,
            task,
        })
    }

    /// Tells the host to drop a download session.
    pub async fn cancel_transfer(&self, file_id: &str, reason: &str) -> Result<(), ClientError> {
        self.inner
            .notify(
                MessageType::FileTransferCancel,
                &FileTransferCancel {
                    file_id: file_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await
    }

    async fn download_buffered(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, ClientError> {
        let (session, first) = open_transfer(&self.inner, path, range).await?;
        let mut processor = BufferedProcessor::new(session);
        let cancel = self.inner.cancel_token().child_token();
        let data = run_to_end(&self.inner, &mut processor, first, &cancel).await?;
        Ok(data.unwrap_or_default())
    }
}

/// A streaming download in progress.
///
/// Read with [`recv`](Self::recv) until [`SinkEvent::End`], then call
/// [`finish`](Self::finish) for the outcome. Dropping the session stops
/// the transfer: no chunk is requested once the receiver is gone.
pub struct StreamSession {
    session: FileTransferSession,
    receiver: SinkReceiver,
    cancel: CancellationToken,
    task: JoinHandle<Result<TransferProgress, ClientError>>,
}

impl StreamSession {
    /// Transfer metadata announced by the host.
    pub fn info(&self) -> &FileTransferSession {
        &self.session
    }

    pub fn file_id(&self) -> &str {
        &self.session.file_id
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub fn mime_type(&self) -> &str {
        &self.session.mime_type
    }

    /// Size of the whole file, not just the requested range.
    pub fn total_size(&self) -> u64 {
        self.session.total_size
    }

    pub fn range(&self) -> Range<u64> {
        self.session.range_start..self.session.range_end
    }

    /// Next piece of the stream; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<SinkEvent> {
        self.receiver.recv().await
    }

    /// Abandons the download before its next chunk request. The host is
    /// told; data already queued stays readable and the stream ends
    /// without [`SinkEvent::End`].
    pub fn cancel(&mut self) {
        self.cancel.cancel();
    }

    /// Waits for the transfer task and returns its final progress.
    pub async fn finish(self) -> Result<TransferProgress, ClientError> {
        drop(self.receiver);
        join(self.task).await
    }

    /// Collects the rest of the stream into memory.
    pub async fn read_to_end(self) -> Result<Vec<u8>, ClientError> {
        let data = self.receiver.read_to_end().await;
        let outcome = join(self.task).await;
        let data = data?;
        outcome?;
        Ok(data)
    }
}

async fn join(
    task: JoinHandle<Result<TransferProgress, ClientError>>,
) -> Result<TransferProgress, ClientError> {
    task.await
        .map_err(|e| ClientError::Cancelled(format!("transfer task ended: {e}")))?
}

/// Sends `FILE_TRANSFER_REQUEST` and returns the session with chunk 0.
async fn open_transfer(
    inner: &ClientInner,
    path: &str,
    range: Option<Range<u64>>,
) -> Result<(FileTransferSession, FileChunk), ClientError> {
    let req = FileTransferRequest {
        path: path.to_string(),
        range_start: range.as_ref().map(|r| r.start),
        range_end: range.as_ref().map(|r| r.end),
        chunk_size: inner.config.chunk_size,
    };
    let resp = inner
        .send_request(MessageType::FileTransferRequest, &req)
        .await?;
    let resp: FileTransferResponse = inner.expect_payload(resp, MessageType::FileTransferResponse)?;
    let session = FileTransferSession::from_response(&resp)?;
    info!(
        file_id = %session.file_id,
        path = %session.path,
        bytes = session.range_len(),
        chunks = session.total_chunks,
        "download started"
    );
    Ok((session, resp.first_chunk))
}

async fn fetch_chunk(
    inner: &ClientInner,
    session: &FileTransferSession,
    index: u64,
    cancel: &CancellationToken,
) -> Result<FileChunk, ClientError> {
    let (start, end) = session.chunk_range(index)?;
    let req = FileChunkRequest {
        file_id: session.file_id.clone(),
        chunk_index: index,
        path: session.path.clone(),
        start,
        end,
    };
    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(ClientError::Cancelled("download cancelled".into())),
        resp = inner.send_request(MessageType::FileChunkRequest, &req) => resp?,
    };
    let chunk: FileChunk = inner.expect_payload(resp, MessageType::FileChunkResponse)?;
    if chunk.chunk_index != index {
        return Err(TransferError::ChunkOutOfRange {
            index: chunk.chunk_index,
            total: session.total_chunks,
        }
        .into());
    }
    Ok(chunk)
}

/// Pulls chunks into `processor` until it completes.
async fn drive<P: ChunkProcessor + ?Sized>(
    inner: &ClientInner,
    processor: &mut P,
    first: FileChunk,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>, ClientError> {
    let session = processor.session().clone();
    let mut last = first.chunk_index;
    let mut next = processor.process_chunk(first).await?;
    let mut rounds = 0;

    loop {
        if processor.should_complete(last, session.is_last(last)) {
            match processor.complete().await {
                Ok(data) => return Ok(data),
                Err(TransferError::Incomplete { missing })
                    if rounds < inner.config.max_missing_retries =>
                {
                    rounds += 1;
                    warn!(
                        file_id = %session.file_id,
                        missing = missing.len(),
                        round = rounds,
                        "re-requesting missing chunks"
                    );
                    next = missing.first().copied();
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(index) = next else {
            return Ok(processor.complete().await?);
        };
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled("download cancelled".into()));
        }
        if !processor.wants_more() {
            return Err(TransferError::SinkAborted("sink stopped accepting".into()).into());
        }
        let chunk = fetch_chunk(inner, &session, index, cancel).await?;
        last = chunk.chunk_index;
        next = processor.process_chunk(chunk).await?;
    }
}

/// Drives `processor`, then closes the host session: with reason
/// `"complete"` on success, or after cancelling the processor on failure.
async fn run_to_end<P: ChunkProcessor + ?Sized>(
    inner: &ClientInner,
    processor: &mut P,
    first: FileChunk,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>, ClientError> {
    let file_id = processor.session().file_id.clone();
    let result = drive(inner, processor, first, cancel).await;

    let reason = match &result {
        Ok(_) => {
            info!(file_id = %file_id, chunks = processor.session().total_chunks, "download complete");
            REASON_COMPLETE.to_string()
        }
        Err(e) => {
            warn!(file_id = %file_id, "download failed: {e}");
            processor.cancel(e.to_string()).await;
            e.to_string()
        }
    };

    let cancel_msg = FileTransferCancel {
        file_id: file_id.clone(),
        reason,
    };
    if let Err(e) = inner
        .notify(MessageType::FileTransferCancel, &cancel_msg)
        .await
    {
        debug!(file_id = %file_id, "could not release host session: {e}");
    }
    result
}
