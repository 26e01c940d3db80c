//! Stock handler: serves a [`FileSystem`] and stores uploads in a
//! [`BlobStore`].

use std::sync::Arc;

use peershare_protocol::messages::{
    DirectoryRequest, DirectoryResponse, FileChunk, FileChunkRequest, FileInfoRequest,
    FileInfoResponse, FileTransferCancel, FileTransferRequest, FileTransferResponse,
    FileUploadCancel, FileUploadChunk, FileUploadChunkAck, FileUploadComplete, FileUploadRequest,
    FileUploadResponse,
};
use peershare_protocol::{HostFeatures, Message, MessageType};
use peershare_transfer::FileTransferSession;
use tracing::{debug, info, warn};

use crate::HostError;
use crate::blob::BlobStore;
use crate::config::HostConfig;
use crate::connection::{LinkContext, Sender};
use crate::fs::FileSystem;
use crate::handler::{Handler, HandlerFuture};
use crate::uploads::{UploadRegistry, is_storage_failure};

/// Open download sessions allowed per link.
pub const MAX_OPEN_TRANSFERS: usize = 64;

/// Serves directory listings, downloads and uploads.
pub struct ShareHandler {
    fs: Arc<dyn FileSystem>,
    uploads: UploadRegistry,
    features: HostFeatures,
}

fn reply_err(sender: &Sender, msg: &Message, e: &HostError) {
    debug!(code = e.code(), "request failed: {e}");
    let _ = sender.send_error(msg, e.code(), &e.to_string());
}

impl ShareHandler {
    pub fn new(config: &HostConfig, fs: Arc<dyn FileSystem>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            fs,
            uploads: UploadRegistry::new(store),
            features: config.features(),
        }
    }

    /// Features advertised in the handshake.
    pub fn features(&self) -> &HostFeatures {
        &self.features
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.uploads
    }

    async fn read_chunk(
        &self,
        session: &FileTransferSession,
        index: u64,
    ) -> Result<FileChunk, HostError> {
        let (start, end) = session.chunk_range(index)?;
        let data = if start == end {
            Vec::new()
        } else {
            self.fs.read_range(&session.path, start, end).await?
        };
        Ok(FileChunk {
            file_id: session.file_id.clone(),
            chunk_index: index,
            data,
            is_first: index == 0,
            is_last: session.is_last(index),
        })
    }

    async fn open_transfer(
        &self,
        link: &mut LinkContext,
        req: FileTransferRequest,
    ) -> Result<FileTransferResponse, HostError> {
        if link.downloads.len() >= MAX_OPEN_TRANSFERS {
            return Err(HostError::TooManyTransfers(MAX_OPEN_TRANSFERS));
        }
        let stat = self.fs.stat_file(&req.path).await?;
        let session = FileTransferSession::plan(
            uuid::Uuid::new_v4().to_string(),
            req.path,
            stat.name,
            stat.mime_type,
            stat.size,
            req.range_start,
            req.range_end,
            req.chunk_size.unwrap_or(self.features.chunk_size),
        )?;
        let first_chunk = self.read_chunk(&session, 0).await?;

        info!(
            link = %link.link_id,
            file_id = %session.file_id,
            path = %session.path,
            bytes = session.range_len(),
            chunks = session.total_chunks,
            "download started"
        );
        let resp = FileTransferResponse {
            file_id: session.file_id.clone(),
            path: session.path.clone(),
            name: session.name.clone(),
            mime_type: session.mime_type.clone(),
            total_size: session.total_size,
            range_start: session.range_start,
            range_end: session.range_end,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            first_chunk,
        };
        link.downloads.insert(session.file_id.clone(), session);
        Ok(resp)
    }

    async fn serve_chunk(
        &self,
        link: &LinkContext,
        req: &FileChunkRequest,
    ) -> Result<FileChunk, HostError> {
        let session = link
            .downloads
            .get(&req.file_id)
            .ok_or_else(|| HostError::UnknownTransfer(req.file_id.clone()))?;
        if req.path != session.path {
            return Err(peershare_transfer::TransferError::WrongTransfer {
                expected: session.path.clone(),
                got: req.path.clone(),
            }
            .into());
        }
        let (start, end) = session.chunk_range(req.chunk_index)?;
        if (req.start, req.end) != (start, end) {
            return Err(peershare_transfer::TransferError::InvalidRange {
                start: req.start,
                end: req.end,
                size: session.total_size,
            }
            .into());
        }
        self.read_chunk(session, req.chunk_index).await
    }

    async fn upload_chunk(
        &self,
        link: &LinkContext,
        sender: &Sender,
        msg: &Message,
        chunk: FileUploadChunk,
    ) {
        let upload_id = chunk.upload_id;
        let index = chunk.chunk_index;
        let file_name = self.uploads.file_name(&upload_id).await.unwrap_or_default();

        match self
            .uploads
            .accept_chunk(&link.link_id, &upload_id, index, chunk.data, chunk.is_last)
            .await
        {
            Ok(accepted) => {
                let ack = FileUploadChunkAck {
                    upload_id: upload_id.clone(),
                    chunk_index: index,
                    duplicate: accepted.duplicate,
                };
                let _ = sender.reply(msg, MessageType::FileUploadChunkAck, &ack);

                if let Some(summary) = accepted.completed {
                    info!(
                        link = %link.link_id,
                        %upload_id,
                        file = %file_name,
                        size = summary.size,
                        "upload complete"
                    );
                    let done = FileUploadComplete {
                        upload_id,
                        success: true,
                        file_name,
                        size: summary.size,
                        checksum: summary.checksum,
                        error: String::new(),
                    };
                    let _ = sender.notify(MessageType::FileUploadComplete, &done);
                }
            }
            Err(e) => {
                reply_err(sender, msg, &e);
                if let HostError::Transfer(te) = &e
                    && is_storage_failure(te)
                {
                    let failed = FileUploadComplete {
                        upload_id,
                        success: false,
                        file_name,
                        size: 0,
                        checksum: String::new(),
                        error: e.to_string(),
                    };
                    let _ = sender.notify(MessageType::FileUploadComplete, &failed);
                }
            }
        }
    }
}

impl Handler for ShareHandler {
    fn on_directory_request<'a>(
        &'a self,
        _link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: DirectoryRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            match self.fs.list_directory(&req.path).await {
                Ok(entries) => {
                    let resp = DirectoryResponse {
                        path: req.path,
                        entries,
                    };
                    let _ = sender.reply(&msg, MessageType::DirectoryResponse, &resp);
                }
                Err(e) => reply_err(&sender, &msg, &e.into()),
            }
        })
    }

    fn on_file_info_request<'a>(
        &'a self,
        _link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileInfoRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            match self.fs.stat_file(&req.path).await {
                Ok(stat) => {
                    let resp = FileInfoResponse {
                        path: req.path,
                        name: stat.name,
                        size: stat.size,
                        mime_type: stat.mime_type,
                        modified_at: stat.modified_at,
                    };
                    let _ = sender.reply(&msg, MessageType::FileInfoResponse, &resp);
                }
                Err(e) => reply_err(&sender, &msg, &e.into()),
            }
        })
    }

    fn on_file_transfer_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileTransferRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            match self.open_transfer(link, req).await {
                Ok(resp) => {
                    let _ = sender.reply(&msg, MessageType::FileTransferResponse, &resp);
                }
                Err(e) => reply_err(&sender, &msg, &e),
            }
        })
    }

    fn on_file_chunk_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileChunkRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            match self.serve_chunk(link, &req).await {
                Ok(chunk) => {
                    let _ = sender.reply(&msg, MessageType::FileChunkResponse, &chunk);
                }
                Err(e) => reply_err(&sender, &msg, &e),
            }
        })
    }

    fn on_file_transfer_cancel<'a>(
        &'a self,
        link: &'a mut LinkContext,
        _sender: Sender,
        _msg: Message,
        req: FileTransferCancel,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if link.downloads.remove(&req.file_id).is_some() {
                debug!(link = %link.link_id, file_id = %req.file_id, reason = %req.reason, "download closed");
            }
        })
    }

    fn on_file_upload_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileUploadRequest,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if !self.features.upload_allowed {
                warn!(link = %link.link_id, file = %req.file_name, "upload refused: uploads disabled");
                reply_err(&sender, &msg, &HostError::UploadsDisabled);
                return;
            }
            match self.uploads.begin(&link.link_id, &req).await {
                Ok(upload_id) => {
                    let resp = FileUploadResponse {
                        upload_id,
                        ready: true,
                    };
                    let _ = sender.reply(&msg, MessageType::FileUploadResponse, &resp);
                }
                Err(e) => reply_err(&sender, &msg, &e),
            }
        })
    }

    fn on_file_upload_chunk<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        chunk: FileUploadChunk,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { self.upload_chunk(link, &sender, &msg, chunk).await })
    }

    fn on_file_upload_cancel<'a>(
        &'a self,
        link: &'a mut LinkContext,
        _sender: Sender,
        _msg: Message,
        req: FileUploadCancel,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.uploads
                .cancel(&link.link_id, &req.upload_id, &req.reason)
                .await;
        })
    }

    fn on_link_closed<'a>(&'a self, link: &'a mut LinkContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            link.downloads.clear();
            self.uploads.release_link(&link.link_id).await;
        })
    }
}
