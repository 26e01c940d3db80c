//! Client connection to one host.
//!
//! Owns the link tasks, correlates requests with responses and exposes
//! the browse API. Transfers live in [`download`](crate::download) and
//! [`upload`](crate::upload).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peershare_crypto::EncryptionKey;
use peershare_link::{
    ConnectionPhase, EnvelopeCodec, KeySlot, PeerChannel, PeerTransport, PhaseEvent,
    PhaseMachine, Role,
};
use peershare_protocol::messages::{
    DirectoryRequest, DirectoryResponse, FileInfoRequest, FileInfoResponse, FileUploadComplete,
};
use peershare_protocol::{HostFeatures, Message, MessageType};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ClientError;
use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::handshake::{PassphrasePrompt, perform_handshake};

/// Callback type for push events from the host.
pub type EventCallback = Box<dyn Fn(MessageType, Message) + Send + Sync>;

/// Callback type for disconnect notification.
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

const WRITE_QUEUE: usize = 256;

/// State shared between the client handle and its read pump.
pub(crate) struct Shared {
    pub correlator: Correlator,
    pub codec: EnvelopeCodec,
    pub phase: Mutex<PhaseMachine>,
    /// Uploads waiting for their `FILE_UPLOAD_COMPLETE`, by upload id.
    pub upload_waiters: Mutex<HashMap<String, oneshot::Sender<FileUploadComplete>>>,
    pub on_event: Mutex<Option<EventCallback>>,
    pub on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl Shared {
    pub fn new(key: KeySlot) -> Self {
        Self {
            correlator: Correlator::new(),
            codec: EnvelopeCodec::new(Role::Client, key),
            phase: Mutex::new(PhaseMachine::new()),
            upload_waiters: Mutex::new(HashMap::new()),
            on_event: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        }
    }
}

pub(crate) struct ClientInner {
    host_id: String,
    pub(crate) config: ClientConfig,
    pub(crate) shared: Arc<Shared>,
    write_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl ClientInner {
    fn start(channel: PeerChannel, config: ClientConfig) -> Self {
        let host_id = channel.peer_id().to_string();
        let (writer, reader) = channel.split();
        let shared = Arc::new(Shared::new(KeySlot::new()));
        let (write_tx, write_rx) = mpsc::channel::<Message>(WRITE_QUEUE);
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            writer,
            write_rx,
            shared.codec.clone(),
            cancel.clone(),
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            reader,
            shared.clone(),
            cancel.clone(),
        ));

        Self {
            host_id,
            config,
            shared,
            write_tx,
            cancel,
            read_handle,
            write_handle,
        }
    }

    /// Queues `msg` if the current phase allows sending it.
    async fn send(&self, msg: Message) -> Result<(), ClientError> {
        {
            let phase = self.shared.phase.lock().await;
            if phase.phase() == ConnectionPhase::Disconnected || self.cancel.is_cancelled() {
                return Err(ClientError::Closed);
            }
            phase.check(msg.msg_type)?;
        }
        self.write_tx
            .send(msg)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Sends a request and waits for the response.
    pub(crate) async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Message, ClientError> {
        self.send_request_with_timeout(msg_type, payload, self.config.request_timeout)
            .await
    }

    pub(crate) async fn send_request_with_timeout<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::request(msg_type, payload, id.as_str())?;

        let rx = self.shared.correlator.register(&id).await?;
        if let Err(e) = self.send(msg).await {
            self.shared.correlator.remove(&id).await;
            return Err(e);
        }
        self.shared.correlator.wait(&id, rx, timeout).await
    }

    /// Sends a message that expects no reply.
    pub(crate) async fn notify<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<(), ClientError> {
        self.send(Message::notification(msg_type, payload)?).await
    }

    /// Checks the response type and decodes its payload.
    pub(crate) fn expect_payload<T: for<'de> serde::Deserialize<'de>>(
        &self,
        msg: Message,
        expected: MessageType,
    ) -> Result<T, ClientError> {
        if msg.msg_type != expected {
            return Err(ClientError::UnexpectedResponse {
                expected,
                got: msg.msg_type,
            });
        }
        msg.parse_payload::<T>()?
            .ok_or(ClientError::MissingPayload(expected))
    }

    pub(crate) async fn install_key(&self, key: EncryptionKey) {
        self.shared.codec.key().set(key).await;
    }

    pub(crate) async fn activate(&self) -> Result<(), ClientError> {
        self.shared
            .phase
            .lock()
            .await
            .apply(PhaseEvent::HandshakeSucceeded)?;
        Ok(())
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && self.shared.phase.lock().await.is_active()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

/// An authenticated connection to a host.
///
/// Cheap to clone; all clones share the link. The link closes when
/// [`close`](Self::close) is called or the last clone is dropped.
#[derive(Clone)]
pub struct PeerClient {
    pub(crate) inner: Arc<ClientInner>,
    features: HostFeatures,
}

impl PeerClient {
    /// Connects to `host_id` over `transport` and runs the handshake.
    pub async fn connect<T: PeerTransport + ?Sized>(
        transport: &T,
        host_id: &str,
        config: ClientConfig,
        prompt: &dyn PassphrasePrompt,
    ) -> Result<Self, ClientError> {
        let channel = transport.connect(host_id).await?;
        Self::from_channel(channel, config, prompt).await
    }

    /// Runs the handshake over an already open channel.
    pub async fn from_channel(
        channel: PeerChannel,
        config: ClientConfig,
        prompt: &dyn PassphrasePrompt,
    ) -> Result<Self, ClientError> {
        let inner = ClientInner::start(channel, config);
        inner
            .shared
            .phase
            .lock()
            .await
            .apply(PhaseEvent::TransportOpened)?;
        debug!(host = %inner.host_id, "link open, starting handshake");

        match perform_handshake(&inner, prompt).await {
            Ok(features) => Ok(Self {
                inner: Arc::new(inner),
                features,
            }),
            Err(e) => {
                warn!(host = %inner.host_id, "handshake failed: {e}");
                let _ = inner
                    .shared
                    .phase
                    .lock()
                    .await
                    .apply(PhaseEvent::HandshakeFailed);
                inner.cancel.cancel();
                Err(e)
            }
        }
    }

    /// Features the host announced in the handshake.
    pub fn features(&self) -> &HostFeatures {
        &self.features
    }

    pub fn host_id(&self) -> &str {
        &self.inner.host_id
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    /// Lists a directory on the host.
    pub async fn list_directory(&self, path: &str) -> Result<DirectoryResponse, ClientError> {
        let resp = self
            .inner
            .send_request(
                MessageType::DirectoryRequest,
                &DirectoryRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        self.inner
            .expect_payload(resp, MessageType::DirectoryResponse)
    }

    /// Fetches metadata for one file.
    pub async fn file_info(&self, path: &str) -> Result<FileInfoResponse, ClientError> {
        let resp = self
            .inner
            .send_request(
                MessageType::FileInfoRequest,
                &FileInfoRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        self.inner.expect_payload(resp, MessageType::FileInfoResponse)
    }

    /// Sets the callback for uncorrelated messages from the host.
    pub async fn set_event_callback(&self, cb: EventCallback) {
        *self.inner.shared.on_event.lock().await = Some(cb);
    }

    /// Sets the callback fired once when the link goes down.
    pub async fn set_disconnect_callback(&self, cb: DisconnectCallback) {
        *self.inner.shared.on_disconnect.lock().await = Some(cb);
    }

    /// Closes the link. Pending requests fail with [`ClientError::Closed`].
    pub fn close(&self) {
        info!(host = %self.inner.host_id, "closing link");
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::NoPassphrase;
    use peershare_link::{ChannelEvent, PeerChannel};
    use peershare_protocol::messages::{MetaRequest, MetaResponse};
    use peershare_transfer::TransferError;

    fn features() -> HostFeatures {
        HostFeatures {
            upload_allowed: false,
            encrypted: false,
            chunk_size: 1024,
            name: "stub".into(),
            protocol_version: peershare_protocol::constants::PROTOCOL_VERSION,
        }
    }

    /// Accepts the plaintext hello, then answers everything else with
    /// `respond`.
    async fn stub_host(
        channel: PeerChannel,
        respond: impl Fn(&Message) -> Option<Message> + Send + 'static,
    ) {
        let (writer, mut reader) = channel.split();
        tokio::spawn(async move {
            while let ChannelEvent::Data(frame) = reader.recv().await {
                let msg = Message::from_bytes(&frame).unwrap();
                let reply = if msg.msg_type == MessageType::MetaRequest {
                    let req: MetaRequest = msg.parse_payload().unwrap().unwrap();
                    assert_eq!(req.message, "hello");
                    Some(
                        msg.reply(
                            MessageType::MetaResponse,
                            &MetaResponse {
                                message: "hello".into(),
                                features: Some(features()),
                                attempts_left: None,
                            },
                        )
                        .unwrap(),
                    )
                } else {
                    respond(&msg)
                };
                if let Some(reply) = reply {
                    if writer.send(reply.to_bytes().unwrap()).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn lists_directory_after_handshake() {
        let (local, remote) = PeerChannel::pair("client", "host", 16);
        stub_host(remote, |msg| {
            Some(
                msg.reply(
                    MessageType::DirectoryResponse,
                    &serde_json::json!({"path": "/", "entries": []}),
                )
                .unwrap(),
            )
        })
        .await;

        let client = PeerClient::from_channel(local, ClientConfig::default(), &NoPassphrase)
            .await
            .unwrap();
        assert_eq!(client.host_id(), "host");
        assert_eq!(client.features().name, "stub");
        assert!(client.is_connected().await);

        let listing = client.list_directory("/").await.unwrap();
        assert_eq!(listing.path, "/");
        assert!(listing.entries.is_empty());
    }

    #[tokio::test]
    async fn wrong_response_type_is_reported() {
        let (local, remote) = PeerChannel::pair("client", "host", 16);
        stub_host(remote, |msg| {
            Some(
                msg.reply(
                    MessageType::DirectoryResponse,
                    &serde_json::json!({"path": "/", "entries": []}),
                )
                .unwrap(),
            )
        })
        .await;

        let client = PeerClient::from_channel(local, ClientConfig::default(), &NoPassphrase)
            .await
            .unwrap();
        let err = client.file_info("/a.txt").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedResponse {
                expected: MessageType::FileInfoResponse,
                got: MessageType::DirectoryResponse,
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_host_times_out_and_clears_pending() {
        let (local, remote) = PeerChannel::pair("client", "host", 16);
        stub_host(remote, |_| None).await;

        let config = ClientConfig {
            request_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        };
        let client = PeerClient::from_channel(local, config, &NoPassphrase)
            .await
            .unwrap();
        let err = client.list_directory("/").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(client.inner.shared.correlator.len().await, 0);
    }

    #[tokio::test]
    async fn close_rejects_further_requests() {
        let (local, remote) = PeerChannel::pair("client", "host", 16);
        stub_host(remote, |_| None).await;

        let client = PeerClient::from_channel(local, ClientConfig::default(), &NoPassphrase)
            .await
            .unwrap();
        client.close();
        let err = client.list_directory("/").await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
        assert!(!client.is_connected().await);
    }

    /// Accepts one write, then stops accepting.
    #[derive(Default)]
    struct StopAfterFirst {
        writes: usize,
    }

    impl peershare_transfer::ByteSink for StopAfterFirst {
        fn ready(&mut self) -> peershare_transfer::SinkFuture<'_, Result<(), TransferError>> {
            Box::pin(async { Ok(()) })
        }

        fn write(
            &mut self,
            _data: Vec<u8>,
        ) -> peershare_transfer::SinkFuture<'_, Result<(), TransferError>> {
            self.writes += 1;
            Box::pin(async { Ok(()) })
        }

        fn close(&mut self) -> peershare_transfer::SinkFuture<'_, Result<(), TransferError>> {
            Box::pin(async { Ok(()) })
        }

        fn abort(&mut self, _reason: String) -> peershare_transfer::SinkFuture<'_, ()> {
            Box::pin(async {})
        }

        fn is_accepting(&self) -> bool {
            self.writes == 0
        }
    }

    #[tokio::test]
    async fn stopped_sink_pulls_no_more_chunks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use peershare_protocol::messages::{FileChunk, FileTransferResponse};

        let data: Vec<u8> = (0..12u8).collect();
        let chunk_requests = Arc::new(AtomicUsize::new(0));
        let counter = chunk_requests.clone();

        let (local, remote) = PeerChannel::pair("client", "host", 16);
        stub_host(remote, move |msg| match msg.msg_type {
            MessageType::FileTransferRequest => Some(
                msg.reply(
                    MessageType::FileTransferResponse,
                    &FileTransferResponse {
                        file_id: "f1".into(),
                        path: "/f.bin".into(),
                        name: "f.bin".into(),
                        mime_type: String::new(),
                        total_size: 12,
                        range_start: 0,
                        range_end: 12,
                        chunk_size: 4,
                        total_chunks: 3,
                        first_chunk: FileChunk {
                            file_id: "f1".into(),
                            chunk_index: 0,
                            data: data[..4].to_vec(),
                            is_first: true,
                            is_last: false,
                        },
                    },
                )
                .unwrap(),
            ),
            MessageType::FileChunkRequest => {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }
            _ => None,
        })
        .await;

        let config = ClientConfig {
            request_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        let client = PeerClient::from_channel(local, config, &NoPassphrase)
            .await
            .unwrap();
        let err = client
            .download_to_sink("/f.bin", None, StopAfterFirst::default())
            .await
            .err()
            .expect("download should stop");
        assert!(matches!(
            err,
            ClientError::Transfer(TransferError::SinkAborted(_))
        ));
        assert_eq!(chunk_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn host_going_away_fires_disconnect() {
        let (local, remote) = PeerChannel::pair("client", "host", 16);
        let (host_tx, mut host_rx) = remote.split();
        let responder = tokio::spawn(async move {
            let ChannelEvent::Data(frame) = host_rx.recv().await else {
                panic!("expected hello");
            };
            let msg = Message::from_bytes(&frame).unwrap();
            let reply = msg
                .reply(
                    MessageType::MetaResponse,
                    &MetaResponse {
                        message: "hello".into(),
                        features: Some(features()),
                        attempts_left: None,
                    },
                )
                .unwrap();
            host_tx.send(reply.to_bytes().unwrap()).await.unwrap();
            (host_tx, host_rx)
        });

        let client = PeerClient::from_channel(local, ClientConfig::default(), &NoPassphrase)
            .await
            .unwrap();
        let (fired_tx, fired_rx) = oneshot::channel::<()>();
        let fired_tx = std::sync::Mutex::new(Some(fired_tx));
        client
            .set_disconnect_callback(Box::new(move || {
                if let Some(tx) = fired_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }))
            .await;

        drop(responder.await.unwrap());
        tokio::time::timeout(Duration::from_secs(2), fired_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_connected().await);
    }
}
