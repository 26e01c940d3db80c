//! Uploads: split a source into chunks and push them with a bounded window.
//!
//! Each `FILE_UPLOAD_CHUNK` is a request answered by
//! `FILE_UPLOAD_CHUNK_ACK`. Failed chunks are retried after
//! [`UploadOptions::retry_delay`] unless the host said the upload is gone
//! (404) or refused (403). The upload ends with an uncorrelated
//! `FILE_UPLOAD_COMPLETE` whose checksum is compared against the digest
//! computed while reading.

use std::future::Future;
use std::pin::Pin;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use peershare_protocol::MessageType;
use peershare_protocol::constants::{ERR_CODE_FORBIDDEN, ERR_CODE_NOT_FOUND, MAX_CHUNK_SIZE};
use peershare_protocol::messages::{
    FileUploadCancel, FileUploadChunk, FileUploadChunkAck, FileUploadComplete, FileUploadRequest,
    FileUploadResponse,
};
use peershare_transfer::{
    OrderedDigest, TransferError, UploadScheduler, UploadSource, total_chunks_for,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ClientError;
use crate::client::{ClientInner, PeerClient};
use crate::config::UploadOptions;

/// Result of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub upload_id: String,
    /// SHA-256 of the bytes sent, hex.
    pub checksum: String,
    /// The host's completion notice.
    pub complete: FileUploadComplete,
}

impl UploadOutcome {
    /// Whether the host stored exactly the bytes that were sent.
    pub fn verified(&self) -> bool {
        self.complete.success && self.complete.checksum == self.checksum
    }
}

enum Step {
    Acked(u64),
    Failed(u64, ClientError),
    Retry(u64),
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Step> + Send + 'a>>;

/// Failures worth another attempt. A 404 means the host dropped the upload
/// and a 403 will not change on retry.
fn is_retryable(err: &ClientError) -> bool {
    match err {
        ClientError::Timeout => true,
        ClientError::Host { code, .. } => *code != ERR_CODE_NOT_FOUND && *code != ERR_CODE_FORBIDDEN,
        _ => false,
    }
}

impl PeerClient {
    /// Uploads `source` to the host's upload directory.
    pub async fn upload_file<S: UploadSource + ?Sized>(
        &self,
        source: &S,
        options: &UploadOptions,
    ) -> Result<UploadOutcome, ClientError> {
        self.upload_file_cancellable(source, options, &CancellationToken::new())
            .await
    }

    /// Like [`upload_file`](Self::upload_file), abandoning the upload when
    /// `cancel` fires. The host is sent `FILE_UPLOAD_CANCEL` on any failure.
    pub async fn upload_file_cancellable<S: UploadSource + ?Sized>(
        &self,
        source: &S,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, ClientError> {
        let inner = &self.inner;
        let chunk_size = options.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidChunkSize(chunk_size).into());
        }
        let size = source.size();
        let total_chunks = total_chunks_for(size, chunk_size);

        let req = FileUploadRequest {
            file_name: source.name().to_string(),
            file_type: source.mime_type().to_string(),
            file_size: size,
            total_chunks,
            chunk_size,
        };
        let resp = inner
            .send_request_with_timeout(MessageType::FileUploadRequest, &req, options.timeout)
            .await?;
        let resp: FileUploadResponse = inner.expect_payload(resp, MessageType::FileUploadResponse)?;
        if !resp.ready {
            return Err(ClientError::UploadFailed("host is not ready".into()));
        }
        let upload_id = resp.upload_id;
        info!(%upload_id, file = %req.file_name, size, chunks = total_chunks, "upload started");

        let (done_tx, done_rx) = oneshot::channel();
        inner
            .shared
            .upload_waiters
            .lock()
            .await
            .insert(upload_id.clone(), done_tx);

        let result = run_upload(inner, source, options, &upload_id, total_chunks, done_rx, cancel).await;

        if let Err(e) = &result {
            warn!(%upload_id, "upload failed: {e}");
            inner.shared.upload_waiters.lock().await.remove(&upload_id);
            if let Err(send_err) = self.cancel_upload(&upload_id, &e.to_string()).await {
                debug!(%upload_id, "could not notify host of cancel: {send_err}");
            }
        }
        result
    }

    /// Tells the host to abandon an upload.
    pub async fn cancel_upload(&self, upload_id: &str, reason: &str) -> Result<(), ClientError> {
        self.inner
            .notify(
                MessageType::FileUploadCancel,
                &FileUploadCancel {
                    upload_id: upload_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await
    }
}

fn send_chunk<'a>(
    inner: &'a ClientInner,
    chunk: FileUploadChunk,
    timeout: std::time::Duration,
) -> StepFuture<'a> {
    Box::pin(async move {
        let index = chunk.chunk_index;
        let result = async {
            let resp = inner
                .send_request_with_timeout(MessageType::FileUploadChunk, &chunk, timeout)
                .await?;
            let ack: FileUploadChunkAck =
                inner.expect_payload(resp, MessageType::FileUploadChunkAck)?;
            if ack.duplicate {
                debug!(upload_id = %ack.upload_id, index, "host already had chunk");
            }
            Ok::<_, ClientError>(())
        }
        .await;
        match result {
            Ok(()) => Step::Acked(index),
            Err(e) => Step::Failed(index, e),
        }
    })
}

fn retry_after<'a>(index: u64, delay: std::time::Duration) -> StepFuture<'a> {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        Step::Retry(index)
    })
}

async fn run_upload<S: UploadSource + ?Sized>(
    inner: &ClientInner,
    source: &S,
    options: &UploadOptions,
    upload_id: &str,
    total_chunks: u64,
    mut done_rx: oneshot::Receiver<FileUploadComplete>,
    cancel: &CancellationToken,
) -> Result<UploadOutcome, ClientError> {
    let size = source.size();
    let mut scheduler =
        UploadScheduler::new(total_chunks, options.concurrent_uploads, options.retries);
    let mut digest = OrderedDigest::new();
    let mut steps: FuturesUnordered<StepFuture<'_>> = FuturesUnordered::new();

    while !scheduler.is_done() {
        while let Some(index) = scheduler.next() {
            let start = index * options.chunk_size;
            let end = (start + options.chunk_size).min(size);
            let data = source.read_range(start, end).await?;
            digest.update(index, &data);
            let chunk = FileUploadChunk {
                upload_id: upload_id.to_string(),
                chunk_index: index,
                data,
                is_last: index + 1 == total_chunks,
            };
            steps.push(send_chunk(inner, chunk, options.timeout));
        }

        let step = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled("upload cancelled".into())),
            step = steps.next() => step,
        };
        match step {
            Some(Step::Acked(index)) => scheduler.ack(index),
            Some(Step::Retry(index)) => scheduler.requeue(index),
            Some(Step::Failed(index, e)) if is_retryable(&e) => {
                let attempts = scheduler.fail(index)?;
                warn!(%upload_id, index, attempts, "chunk failed, retrying: {e}");
                steps.push(retry_after(index, options.retry_delay));
            }
            Some(Step::Failed(index, e)) => {
                // A storage failure on the host arrives as a failed completion.
                if let Ok(done) = done_rx.try_recv()
                    && !done.success
                {
                    return Err(ClientError::UploadFailed(done.error));
                }
                debug!(%upload_id, index, "chunk failed permanently");
                return Err(e);
            }
            None => {
                return Err(ClientError::UploadFailed(format!(
                    "{} of {total_chunks} chunks acknowledged",
                    scheduler.acked()
                )));
            }
        }
    }

    let done = tokio::select! {
        _ = cancel.cancelled() => return Err(ClientError::Cancelled("upload cancelled".into())),
        done = tokio::time::timeout(options.timeout, &mut done_rx) => match done {
            Ok(Ok(done)) => done,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => return Err(ClientError::Timeout),
        },
    };
    if !done.success {
        return Err(ClientError::UploadFailed(done.error));
    }

    let outcome = UploadOutcome {
        upload_id: upload_id.to_string(),
        checksum: digest.finalize(),
        complete: done,
    };
    if outcome.verified() {
        info!(%upload_id, size = outcome.complete.size, "upload verified");
    } else {
        warn!(
            %upload_id,
            sent = %outcome.checksum,
            stored = %outcome.complete.checksum,
            "upload checksum mismatch"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(checksum: &str, success: bool) -> FileUploadComplete {
        FileUploadComplete {
            upload_id: "u1".into(),
            success,
            file_name: "a.txt".into(),
            size: 3,
            checksum: checksum.into(),
            error: String::new(),
        }
    }

    #[test]
    fn retry_rules() {
        assert!(is_retryable(&ClientError::Timeout));
        assert!(is_retryable(&ClientError::Host {
            code: 500,
            message: "disk busy".into()
        }));
        assert!(!is_retryable(&ClientError::Host {
            code: ERR_CODE_NOT_FOUND,
            message: "unknown upload".into()
        }));
        assert!(!is_retryable(&ClientError::Host {
            code: ERR_CODE_FORBIDDEN,
            message: "uploads disabled".into()
        }));
        assert!(!is_retryable(&ClientError::Closed));
    }

    #[test]
    fn outcome_verification() {
        let ok = UploadOutcome {
            upload_id: "u1".into(),
            checksum: "abc".into(),
            complete: complete("abc", true),
        };
        assert!(ok.verified());

        let mismatch = UploadOutcome {
            complete: complete("def", true),
            ..ok.clone()
        };
        assert!(!mismatch.verified());

        let failed = UploadOutcome {
            complete: complete("abc", false),
            ..ok
        };
        assert!(!failed.verified());
    }
}
