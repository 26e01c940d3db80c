//! Per-link actor: write pump, handshake, phase gating and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use peershare_crypto::EncryptionKey;
use peershare_link::{
    Admission, ChannelEvent, ChannelReader, ChannelWriter, EnvelopeCodec, KeySlot, PeerChannel,
    PhaseEvent, PhaseMachine, Role,
};
use peershare_protocol::constants::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_FORBIDDEN, ERR_CODE_HANDSHAKE_REQUIRED,
    ERR_CODE_NOT_IMPLEMENTED,
};
use peershare_protocol::messages::MetaRequest;
use peershare_protocol::{Body, HostFeatures, Message, MessageType};
use peershare_transfer::FileTransferSession;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;
use crate::handshake::{HandshakeStep, HostHandshake};

/// Handle for sending messages to one client.
///
/// Wraps an `mpsc::Sender`, so clones are cheap. Messages are encoded
/// (and encrypted, once a key is set) by the link's write pump.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Message>,
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

impl Sender {
    #[cfg(test)]
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues a message.
    ///
    /// Returns `Err` only if the buffer is full or the link is gone.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|_| {
            warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends a typed response to `req`.
    pub fn reply<T: Serialize>(
        &self,
        req: &Message,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<(), SendError> {
        let msg = req.reply(msg_type, payload).map_err(|e| {
            error!(?msg_type, "failed to serialize reply: {e}");
            SendError
        })?;
        self.send_msg(msg)
    }

    /// Sends an uncorrelated notification.
    pub fn notify<T: Serialize>(&self, msg_type: MessageType, payload: &T) -> Result<(), SendError> {
        let msg = Message::notification(msg_type, payload).map_err(|e| {
            error!(?msg_type, "failed to serialize notification: {e}");
            SendError
        })?;
        self.send_msg(msg)
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// State a handler keeps per link.
#[derive(Debug)]
pub struct LinkContext {
    pub link_id: String,
    /// Download sessions by file id.
    pub downloads: HashMap<String, FileTransferSession>,
}

impl LinkContext {
    pub fn new(link_id: impl Into<String>) -> Self {
        Self {
            link_id: link_id.into(),
            downloads: HashMap::new(),
        }
    }
}

/// Handshake parameters shared by every link of a host.
#[derive(Debug, Clone)]
pub(crate) struct HandshakeSettings {
    pub key: Option<EncryptionKey>,
    pub features: HostFeatures,
    pub max_attempts: u32,
}

/// A running link.
pub struct LinkHandle {
    link_id: String,
    sender: Sender,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the link to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Closes the link and waits until its cleanup has run.
    pub async fn close_and_wait(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(link = %self.link_id, "link task failed: {e}");
        }
    }
}

/// Starts the actor for a freshly accepted channel.
pub(crate) fn spawn_link<H: Handler>(
    channel: PeerChannel,
    handler: Arc<H>,
    settings: HandshakeSettings,
    server_cancel: &CancellationToken,
) -> LinkHandle {
    let link_id = channel.peer_id().to_string();
    let (writer, reader) = channel.split();
    let (tx, rx) = mpsc::channel::<Message>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };
    let codec = EnvelopeCodec::new(Role::Host, KeySlot::new());

    tokio::spawn(write_pump(writer, rx, codec.clone(), cancel.clone()));

    let actor = LinkActor {
        require_encryption: settings.key.is_some(),
        handshake: HostHandshake::new(settings.key, settings.features, settings.max_attempts),
        phase: PhaseMachine::new(),
        ctx: LinkContext::new(link_id.clone()),
        codec,
        sender: sender.clone(),
        handler,
    };
    let task = tokio::spawn(actor.run(reader, cancel.clone()));

    LinkHandle {
        link_id,
        sender,
        cancel,
        task,
    }
}

/// Write pump: encodes queued messages onto the channel. On cancellation
/// it flushes what is already queued, so a final ERROR still goes out.
async fn write_pump(
    writer: ChannelWriter,
    mut rx: mpsc::Receiver<Message>,
    codec: EnvelopeCodec,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        if !write_one(&writer, &codec, msg).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = cancel.cancelled() => {
                while let Ok(msg) = rx.try_recv() {
                    if !write_one(&writer, &codec, msg).await {
                        break;
                    }
                }
                break;
            }
        }
    }
    writer.close().await;
}

async fn write_one(writer: &ChannelWriter, codec: &EnvelopeCodec, msg: Message) -> bool {
    let frame = match codec.encode(&msg).await {
        Ok(frame) => frame,
        Err(e) => {
            error!(msg_type = ?msg.msg_type, "failed to encode message: {e}");
            return true;
        }
    };
    if let Err(e) = writer.send(frame).await {
        debug!("write pump stopped: {e}");
        return false;
    }
    true
}

enum Flow {
    Continue,
    Close,
}

struct LinkActor<H> {
    ctx: LinkContext,
    phase: PhaseMachine,
    handshake: HostHandshake,
    require_encryption: bool,
    codec: EnvelopeCodec,
    sender: Sender,
    handler: Arc<H>,
}

impl<H: Handler> LinkActor<H> {
    async fn run(mut self, mut reader: ChannelReader, cancel: CancellationToken) {
        let link = self.ctx.link_id.clone();
        if let Err(e) = self.phase.apply(PhaseEvent::TransportOpened) {
            error!(%link, "{e}");
            return;
        }
        info!(%link, "link opened");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = reader.recv() => event,
            };
            let frame = match event {
                ChannelEvent::Data(frame) => frame,
                ChannelEvent::Closed => break,
                ChannelEvent::Error(e) => {
                    error!(%link, "transport error: {e}");
                    break;
                }
            };
            if let Flow::Close = self.handle_frame(&frame).await {
                break;
            }
        }

        let _ = self.phase.apply(PhaseEvent::TransportClosed);
        self.codec.key().clear().await;
        self.handler.on_link_closed(&mut self.ctx).await;
        cancel.cancel();
        info!(%link, "link closed");
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Flow {
        let decoded = match self.codec.decode(frame).await {
            Ok(d) => d,
            Err(e) => {
                warn!(link = %self.ctx.link_id, "dropping undecodable frame: {e}");
                return Flow::Continue;
            }
        };
        let msg = decoded.message;

        match self.phase.admit(msg.msg_type) {
            Admission::Accept => {}
            Admission::HandshakeRequired => {
                warn!(link = %self.ctx.link_id, msg_type = ?msg.msg_type, "message before handshake");
                let _ = self.sender.send_error(
                    &msg,
                    ERR_CODE_HANDSHAKE_REQUIRED,
                    "handshake required first",
                );
                return Flow::Continue;
            }
            Admission::AlreadyActive => {
                let _ = self
                    .sender
                    .send_error(&msg, ERR_CODE_BAD_REQUEST, "handshake already completed");
                return Flow::Continue;
            }
            Admission::Unsupported => {
                warn!(link = %self.ctx.link_id, msg_type = ?msg.msg_type, "unsupported message type");
                let _ = self.sender.send_error(
                    &msg,
                    ERR_CODE_NOT_IMPLEMENTED,
                    "unsupported message type",
                );
                return Flow::Continue;
            }
            Admission::Closed => return Flow::Close,
        }

        if msg.is_error() {
            if let Some(err) = msg.error_payload() {
                warn!(link = %self.ctx.link_id, code = err.code, "client reported error: {}", err.message);
            }
            return Flow::Continue;
        }

        if !self.phase.is_active() {
            return self.handle_handshake(msg).await;
        }

        if self.require_encryption && !decoded.encrypted {
            warn!(link = %self.ctx.link_id, msg_type = ?msg.msg_type, "plaintext message on encrypted link");
            let _ = self
                .sender
                .send_error(&msg, ERR_CODE_FORBIDDEN, "encryption required");
            return Flow::Continue;
        }

        self.dispatch(msg).await;
        Flow::Continue
    }

    async fn handle_handshake(&mut self, msg: Message) -> Flow {
        if msg.msg_type != MessageType::MetaRequest {
            let _ = self
                .sender
                .send_error(&msg, ERR_CODE_BAD_REQUEST, "expected META_REQUEST");
            return Flow::Continue;
        }
        let req: MetaRequest = match msg.parse_payload() {
            Ok(Some(req)) => req,
            _ => {
                let _ = self
                    .sender
                    .send_error(&msg, ERR_CODE_BAD_REQUEST, "malformed META_REQUEST");
                return Flow::Continue;
            }
        };

        match self.handshake.handle(&req) {
            HandshakeStep::Continue(resp) => {
                let _ = self.sender.reply(&msg, MessageType::MetaResponse, &resp);
                Flow::Continue
            }
            HandshakeStep::Accepted(resp) => {
                if let Some(key) = self.handshake.key() {
                    self.codec.key().set(key.clone()).await;
                }
                let _ = self.phase.apply(PhaseEvent::HandshakeSucceeded);
                info!(
                    link = %self.ctx.link_id,
                    platform = %req.platform,
                    version = %req.version,
                    encrypted = self.require_encryption,
                    "handshake complete"
                );
                let _ = self.sender.reply(&msg, MessageType::MetaResponse, &resp);
                Flow::Continue
            }
            HandshakeStep::Rejected { code, message } => {
                let _ = self.sender.send_error(&msg, code, &message);
                Flow::Continue
            }
            HandshakeStep::Failed { code, message } => {
                warn!(link = %self.ctx.link_id, "handshake failed: {message}");
                let _ = self.sender.send_error(&msg, code, &message);
                let _ = self.phase.apply(PhaseEvent::HandshakeFailed);
                Flow::Close
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) {
        let body = match Body::decode(&msg) {
            Ok(body) => body,
            Err(e) => {
                let _ = self.sender.send_error(
                    &msg,
                    ERR_CODE_BAD_REQUEST,
                    &format!("malformed payload: {e}"),
                );
                return;
            }
        };

        let s = self.sender.clone();
        let ctx = &mut self.ctx;
        let h = &self.handler;
        match body {
            Body::DirectoryRequest(req) => h.on_directory_request(ctx, s, msg, req).await,
            Body::FileInfoRequest(req) => h.on_file_info_request(ctx, s, msg, req).await,
            Body::FileTransferRequest(req) => h.on_file_transfer_request(ctx, s, msg, req).await,
            Body::FileChunkRequest(req) => h.on_file_chunk_request(ctx, s, msg, req).await,
            Body::FileTransferCancel(req) => h.on_file_transfer_cancel(ctx, s, msg, req).await,
            Body::FileUploadRequest(req) => h.on_file_upload_request(ctx, s, msg, req).await,
            Body::FileUploadChunk(chunk) => h.on_file_upload_chunk(ctx, s, msg, chunk).await,
            Body::FileUploadCancel(req) => h.on_file_upload_cancel(ctx, s, msg, req).await,
            other => {
                warn!(link = %ctx.link_id, msg_type = ?other.msg_type(), "unexpected message from client");
                let _ = s.send_error(&msg, ERR_CODE_BAD_REQUEST, "unexpected message type");
            }
        }
    }
}
