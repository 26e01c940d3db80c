//! Handler trait for application messages on an active link.
//!
//! The connection actor owns the handshake, phase checks and decryption;
//! a handler only sees typed requests from links that are ACTIVE.

use std::future::Future;
use std::pin::Pin;

use peershare_protocol::Message;
use peershare_protocol::constants::ERR_CODE_NOT_IMPLEMENTED;
use peershare_protocol::messages::{
    DirectoryRequest, FileChunkRequest, FileInfoRequest, FileTransferCancel, FileTransferRequest,
    FileUploadCancel, FileUploadChunk, FileUploadRequest,
};

use crate::connection::{LinkContext, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

fn not_implemented<'a>(sender: Sender, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}

/// Application logic of a host.
///
/// Each method receives:
/// - `link`: per-link state owned by the connection actor
/// - `sender`: channel back to the client
/// - `msg`: the decoded envelope (for correlation)
/// - the typed payload
///
/// Default implementations reply 501 so handlers only override what they
/// serve. Calls for one link are made one at a time, in arrival order.
pub trait Handler: Send + Sync + 'static {
    fn on_directory_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: DirectoryRequest,
    ) -> HandlerFuture<'a> {
        let _ = (link, req);
        not_implemented(sender, msg)
    }

    fn on_file_info_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileInfoRequest,
    ) -> HandlerFuture<'a> {
        let _ = (link, req);
        not_implemented(sender, msg)
    }

    fn on_file_transfer_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileTransferRequest,
    ) -> HandlerFuture<'a> {
        let _ = (link, req);
        not_implemented(sender, msg)
    }

    fn on_file_chunk_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileChunkRequest,
    ) -> HandlerFuture<'a> {
        let _ = (link, req);
        not_implemented(sender, msg)
    }

    /// Fire-and-forget; no reply expected.
    fn on_file_transfer_cancel<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileTransferCancel,
    ) -> HandlerFuture<'a> {
        let _ = (link, sender, msg, req);
        Box::pin(async {})
    }

    fn on_file_upload_request<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileUploadRequest,
    ) -> HandlerFuture<'a> {
        let _ = (link, req);
        not_implemented(sender, msg)
    }

    fn on_file_upload_chunk<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        chunk: FileUploadChunk,
    ) -> HandlerFuture<'a> {
        let _ = (link, chunk);
        not_implemented(sender, msg)
    }

    /// Fire-and-forget; no reply expected.
    fn on_file_upload_cancel<'a>(
        &'a self,
        link: &'a mut LinkContext,
        sender: Sender,
        msg: Message,
        req: FileUploadCancel,
    ) -> HandlerFuture<'a> {
        let _ = (link, sender, msg, req);
        Box::pin(async {})
    }

    /// Called once when the link closes (cleanup hook).
    fn on_link_closed<'a>(&'a self, link: &'a mut LinkContext) -> HandlerFuture<'a> {
        let _ = link;
        Box::pin(async {})
    }
}
