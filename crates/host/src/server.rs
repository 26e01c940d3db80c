//! Host accept loop.
//!
//! Takes links from a [`PeerListener`], runs one actor per link and
//! tears them all down on shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use peershare_link::PeerListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::HostError;
use crate::blob::BlobStore;
use crate::config::HostConfig;
use crate::connection::{self, HandshakeSettings, LinkHandle};
use crate::fs::FileSystem;
use crate::handler::Handler;
use crate::share::ShareHandler;
use crate::uploads::UploadRegistry;

struct UploadGc {
    registry: UploadRegistry,
    interval: Duration,
    idle: Duration,
}

/// The host server.
///
/// Any number of clients may be linked at once; each gets its own
/// handshake, key and phase.
pub struct HostServer<H: Handler> {
    handler: Arc<H>,
    settings: HandshakeSettings,
    upload_gc: Option<UploadGc>,
    links: Mutex<Vec<LinkHandle>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl<H: Handler> HostServer<H> {
    /// Creates a server dispatching to `handler`.
    ///
    /// The passphrase (if any) is stretched into the session key here,
    /// once, not per link.
    pub fn new(config: &HostConfig, handler: H) -> Arc<Self> {
        Self::build(config, handler, None)
    }

    fn build(config: &HostConfig, handler: H, upload_gc: Option<UploadGc>) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            settings: HandshakeSettings {
                key: config.session_key(),
                features: config.features(),
                max_attempts: config.max_passphrase_attempts,
            },
            upload_gc,
            links: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Number of links still open.
    pub async fn link_count(&self) -> usize {
        self.links
            .lock()
            .await
            .iter()
            .filter(|l| !l.is_finished())
            .count()
    }

    /// Closes one link by id. Returns `false` if it is not open.
    pub async fn disconnect(&self, link_id: &str) -> bool {
        let links = self.links.lock().await;
        match links
            .iter()
            .find(|l| l.link_id() == link_id && !l.is_finished())
        {
            Some(link) => {
                link.close();
                true
            }
            None => false,
        }
    }

    /// Gracefully shuts down the server and every link.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs until [`shutdown`](Self::shutdown) or until the listener closes.
    pub async fn run(self: &Arc<Self>, mut listener: PeerListener) -> Result<(), HostError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HostError::AlreadyRunning);
        }
        tracing::info!(host = %listener.id(), "host listening");

        let gc_cancel = self.cancel.child_token();
        let gc = self
            .upload_gc
            .as_ref()
            .map(|g| g.registry.spawn_gc(g.interval, g.idle, gc_cancel.clone()));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("host shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    let Some(channel) = accepted else {
                        tracing::info!("listener closed");
                        break;
                    };
                    tracing::info!(peer = %channel.peer_id(), "link accepted");
                    let link = connection::spawn_link(
                        channel,
                        Arc::clone(&self.handler),
                        self.settings.clone(),
                        &self.cancel,
                    );
                    let mut links = self.links.lock().await;
                    links.retain(|l| !l.is_finished());
                    links.push(link);
                }
            }
        }

        let links: Vec<LinkHandle> = self.links.lock().await.drain(..).collect();
        for link in links {
            link.close_and_wait().await;
        }
        gc_cancel.cancel();
        if let Some(gc) = gc {
            let _ = gc.await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl HostServer<ShareHandler> {
    /// Creates a server sharing `fs` and storing uploads in `store`, with
    /// idle uploads collected in the background.
    pub fn share(
        config: &HostConfig,
        fs: Arc<dyn FileSystem>,
        store: Arc<dyn BlobStore>,
    ) -> Arc<Self> {
        let handler = ShareHandler::new(config, fs, store);
        let gc = UploadGc {
            registry: handler.registry().clone(),
            interval: config.gc_interval,
            idle: config.upload_idle_timeout,
        };
        Self::build(config, handler, Some(gc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::fs::LocalFileSystem;
    use peershare_crypto::KeyDerivation;
    use peershare_link::{
        ChannelEvent, ChannelReader, ChannelWriter, EnvelopeCodec, KeySlot, MemoryNetwork,
        PeerTransport, Role,
    };
    use peershare_protocol::messages::{DirectoryRequest, DirectoryResponse, MetaRequest};
    use peershare_protocol::{EncryptedPayload, Message, MessageType};
    use tempfile::TempDir;

    /// Raw client end that speaks envelopes without the client crate.
    struct RawClient {
        writer: ChannelWriter,
        reader: ChannelReader,
        codec: EnvelopeCodec,
        seq: u32,
    }

    impl RawClient {
        async fn connect(net: &MemoryNetwork) -> Self {
            let (writer, reader) = net.connect("host").await.unwrap().split();
            Self {
                writer,
                reader,
                codec: EnvelopeCodec::new(Role::Client, KeySlot::new()),
                seq: 0,
            }
        }

        fn next<T: serde::Serialize>(&mut self, msg_type: MessageType, payload: &T) -> Message {
            self.seq += 1;
            Message::request(msg_type, payload, format!("req-{}", self.seq)).unwrap()
        }

        async fn request<T: serde::Serialize>(
            &mut self,
            msg_type: MessageType,
            payload: &T,
        ) -> Message {
            let msg = self.next(msg_type, payload);
            let frame = self.codec.encode(&msg).await.unwrap();
            self.writer.send(frame).await.unwrap();
            self.recv().await.expect("link closed before reply")
        }

        /// Sends without sealing, even when the codec holds a key.
        async fn request_plain<T: serde::Serialize>(
            &mut self,
            msg_type: MessageType,
            payload: &T,
        ) -> Message {
            let msg = self.next(msg_type, payload);
            self.writer.send(msg.to_bytes().unwrap()).await.unwrap();
            self.recv().await.expect("link closed before reply")
        }

        async fn recv(&mut self) -> Option<Message> {
            match self.reader.recv().await {
                ChannelEvent::Data(frame) => Some(self.codec.decode(&frame).await.unwrap().message),
                _ => None,
            }
        }
    }

    fn hello(sealed: Option<EncryptedPayload>) -> MetaRequest {
        MetaRequest {
            message: "hello".into(),
            sealed,
            platform: "test".into(),
            version: "0.1.0".into(),
            protocol_version: 1,
        }
    }

    fn sealed_hello(passphrase: &str) -> EncryptedPayload {
        let key = KeyDerivation::with_iterations(2).derive(passphrase);
        let s = peershare_crypto::encrypt(&key, b"hello").unwrap();
        EncryptedPayload {
            ciphertext: s.ciphertext,
            nonce: s.nonce.to_vec(),
        }
    }

    async fn start(
        config: HostConfig,
    ) -> (TempDir, MemoryNetwork, Arc<HostServer<ShareHandler>>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        let fs = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        let server = HostServer::share(&config, fs, Arc::new(MemoryBlobStore::new()));

        let net = MemoryNetwork::default();
        let listener = net.listen("host").await.unwrap();
        let s = Arc::clone(&server);
        tokio::spawn(async move { s.run(listener).await.unwrap() });
        (dir, net, server)
    }

    fn keyed_config() -> HostConfig {
        HostConfig {
            key_derivation: KeyDerivation::with_iterations(2),
            ..HostConfig::default()
        }
        .with_passphrase("open sesame")
    }

    #[tokio::test]
    async fn requests_before_handshake_are_refused() {
        let (_dir, net, server) = start(HostConfig::default()).await;
        let mut client = RawClient::connect(&net).await;

        let req = DirectoryRequest { path: "/".into() };
        let reply = client.request(MessageType::DirectoryRequest, &req).await;
        assert_eq!(reply.error_payload().unwrap().code, 428);

        let reply = client.request(MessageType::MetaRequest, &hello(None)).await;
        assert_eq!(reply.msg_type, MessageType::MetaResponse);

        let reply = client.request(MessageType::DirectoryRequest, &req).await;
        let listing: DirectoryResponse = reply.parse_payload().unwrap().unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "a.txt");

        // A second handshake is refused.
        let reply = client.request(MessageType::MetaRequest, &hello(None)).await;
        assert_eq!(reply.error_payload().unwrap().code, 400);

        server.shutdown();
    }

    #[tokio::test]
    async fn third_wrong_passphrase_closes_the_link() {
        let (_dir, net, server) = start(keyed_config()).await;
        let mut client = RawClient::connect(&net).await;

        let reply = client.request(MessageType::MetaRequest, &hello(None)).await;
        let meta: peershare_protocol::messages::MetaResponse =
            reply.parse_payload().unwrap().unwrap();
        assert_eq!(meta.message, "encrypted");

        for _ in 0..2 {
            let reply = client
                .request(MessageType::MetaRequest, &hello(Some(sealed_hello("wrong"))))
                .await;
            assert_eq!(reply.msg_type, MessageType::MetaResponse);
        }
        let reply = client
            .request(MessageType::MetaRequest, &hello(Some(sealed_hello("wrong"))))
            .await;
        assert_eq!(reply.error_payload().unwrap().code, 401);
        assert!(client.recv().await.is_none());

        server.shutdown();
    }

    #[tokio::test]
    async fn plaintext_is_refused_once_encrypted() {
        let (_dir, net, server) = start(keyed_config()).await;
        let mut client = RawClient::connect(&net).await;

        let reply = client
            .request(
                MessageType::MetaRequest,
                &hello(Some(sealed_hello("open sesame"))),
            )
            .await;
        assert_eq!(reply.msg_type, MessageType::MetaResponse);

        client
            .codec
            .key()
            .set(KeyDerivation::with_iterations(2).derive("open sesame"))
            .await;

        let req = DirectoryRequest { path: "/".into() };
        let reply = client
            .request_plain(MessageType::DirectoryRequest, &req)
            .await;
        assert_eq!(reply.error_payload().unwrap().code, 403);

        let reply = client.request(MessageType::DirectoryRequest, &req).await;
        assert_eq!(reply.msg_type, MessageType::DirectoryResponse);

        server.shutdown();
    }

    #[tokio::test]
    async fn shutdown_closes_links() {
        let (_dir, net, server) = start(HostConfig::default()).await;
        let mut client = RawClient::connect(&net).await;
        client.request(MessageType::MetaRequest, &hello(None)).await;
        assert_eq!(server.link_count().await, 1);

        server.shutdown();
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let (_dir, net, server) = start(HostConfig::default()).await;
        // Let the first run take the flag.
        let mut client = RawClient::connect(&net).await;
        client.request(MessageType::MetaRequest, &hello(None)).await;

        let listener = net.listen("host-2").await.unwrap();
        assert!(matches!(
            server.run(listener).await,
            Err(HostError::AlreadyRunning)
        ));
        server.shutdown();
    }
}
