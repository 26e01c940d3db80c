//! Host and client wired together over an in-process network.

use std::sync::Arc;
use std::time::Duration;

use peershare_client::{
    ClientConfig, ClientError, FixedPassphrase, HandshakeError, NoPassphrase, PassphrasePrompt,
    PeerClient, UploadOptions,
};
use peershare_crypto::KeyDerivation;
use peershare_host::{
    BlobStore, HostConfig, HostError, HostServer, LocalFileSystem, MemoryBlobStore, ShareHandler,
};
use peershare_link::MemoryNetwork;
use peershare_transfer::{
    MemorySource, SinkEvent, SinkFuture, TransferError, UploadSource, channel_sink,
};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const KIB: usize = 1024;

struct Harness {
    _dir: TempDir,
    net: MemoryNetwork,
    server: Arc<HostServer<ShareHandler>>,
    store: MemoryBlobStore,
    run: JoinHandle<Result<(), HostError>>,
}

impl Harness {
    async fn start(config: HostConfig, files: &[(&str, &[u8])]) -> Self {
        let dir = TempDir::new().unwrap();
        for (name, data) in files {
            std::fs::write(dir.path().join(name), data).unwrap();
        }
        let config = HostConfig {
            key_derivation: KeyDerivation::with_iterations(2),
            ..config
        };
        let fs = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        let store = MemoryBlobStore::new();
        let server = HostServer::share(&config, fs, Arc::new(store.clone()));

        let net = MemoryNetwork::default();
        let listener = net.listen("host").await.unwrap();
        let run = {
            let server = server.clone();
            tokio::spawn(async move { server.run(listener).await })
        };
        Self {
            _dir: dir,
            net,
            server,
            store,
            run,
        }
    }

    async fn connect(&self, prompt: &dyn PassphrasePrompt) -> Result<PeerClient, ClientError> {
        PeerClient::connect(&self.net, "host", client_config(), prompt).await
    }

    async fn stop(self) {
        self.server.shutdown();
        self.run.await.unwrap().unwrap();
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        key_derivation: KeyDerivation::with_iterations(2),
        request_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn fast_retries() -> UploadOptions {
    UploadOptions {
        chunk_size: 1000,
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        ..UploadOptions::default()
    }
}

#[tokio::test]
async fn plaintext_session_browses_and_downloads() {
    let data = pattern(2500);
    let h = Harness::start(
        HostConfig {
            name: "den".into(),
            chunk_size: 1000,
            ..HostConfig::default()
        },
        &[("notes.txt", &b"hello"[..]), ("clip.bin", data.as_slice())],
    )
    .await;

    let client = h.connect(&NoPassphrase).await.unwrap();
    assert_eq!(client.features().name, "den");
    assert!(!client.features().encrypted);
    assert!(!client.features().upload_allowed);

    let listing = client.list_directory("/").await.unwrap();
    let mut names: Vec<_> = listing.entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["clip.bin", "notes.txt"]);

    let info = client.file_info("/clip.bin").await.unwrap();
    assert_eq!(info.size, 2500);

    assert_eq!(client.download("/clip.bin").await.unwrap(), data);
    assert_eq!(
        client.download_range("/clip.bin", 990..1010).await.unwrap(),
        data[990..1010]
    );

    client.close();
    h.stop().await;
}

#[tokio::test]
async fn missing_file_is_host_404() {
    let h = Harness::start(HostConfig::default(), &[]).await;
    let client = h.connect(&NoPassphrase).await.unwrap();

    match client.download("/nope.bin").await {
        Err(ClientError::Host { code, .. }) => assert_eq!(code, 404),
        other => panic!("unexpected {other:?}"),
    }
    // The link survives an application error.
    assert!(client.list_directory("/").await.is_ok());
    h.stop().await;
}

#[tokio::test]
async fn encrypted_session_round_trips() {
    let data = pattern(3000);
    let h = Harness::start(
        HostConfig {
            chunk_size: 1024,
            ..HostConfig::default()
        }
        .with_passphrase("open sesame")
        .with_uploads(true),
        &[("clip.bin", data.as_slice())],
    )
    .await;

    let client = h.connect(&FixedPassphrase::new("open sesame")).await.unwrap();
    assert!(client.features().encrypted);
    assert_eq!(client.download("/clip.bin").await.unwrap(), data);

    let outcome = client
        .upload_file(&MemorySource::new("up.bin", pattern(1500)), &fast_retries())
        .await
        .unwrap();
    assert!(outcome.verified());
    h.stop().await;
}

#[tokio::test]
async fn passphrase_is_required_by_encrypted_host() {
    let h = Harness::start(HostConfig::default().with_passphrase("pw"), &[]).await;
    let err = h
        .connect(&NoPassphrase)
        .await
        .err()
        .expect("plaintext hello must not be accepted");
    assert!(matches!(
        err,
        ClientError::Handshake(HandshakeError::PassphraseRequired)
    ));
    h.stop().await;
}

#[tokio::test]
async fn three_wrong_passphrases_close_the_link() {
    let h = Harness::start(HostConfig::default().with_passphrase("right"), &[]).await;
    let err = h
        .connect(&FixedPassphrase::new("wrong"))
        .await
        .err()
        .expect("wrong passphrase must not be accepted");
    assert!(
        matches!(err, ClientError::Handshake(HandshakeError::PassphraseRejected(_))),
        "got {err:?}"
    );

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.server.link_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("host should drop the link");
    h.stop().await;
}

#[tokio::test]
async fn streams_large_file_in_three_chunks() {
    let data = pattern(1536 * KIB);
    let h = Harness::start(HostConfig::default(), &[("big.bin", data.as_slice())]).await;
    let client = h.connect(&NoPassphrase).await.unwrap();

    let mut stream = client.begin_session("/big.bin", None).await.unwrap();
    assert_eq!(stream.name(), "big.bin");
    assert_eq!(stream.total_size(), data.len() as u64);
    assert_eq!(stream.info().total_chunks, 3);

    let mut received = Vec::new();
    let mut pieces = 0;
    loop {
        match stream.recv().await {
            Some(SinkEvent::Data(bytes)) => {
                assert_eq!(bytes.len(), 512 * KIB);
                received.extend_from_slice(&bytes);
                pieces += 1;
            }
            Some(SinkEvent::End) => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(pieces, 3);
    assert_eq!(received, data);
    let progress = stream.finish().await.unwrap();
    assert_eq!(progress.progress, 100.0);
    h.stop().await;
}

#[tokio::test]
async fn download_into_caller_sink() {
    let data = pattern(2500);
    let h = Harness::start(
        HostConfig {
            chunk_size: 1000,
            ..HostConfig::default()
        },
        &[("clip.bin", data.as_slice())],
    )
    .await;
    let client = h.connect(&NoPassphrase).await.unwrap();

    let (sink, rx) = channel_sink(1);
    let reader = tokio::spawn(rx.read_to_end());
    let session = client
        .download_to_sink("/clip.bin", Some(500..2500), sink)
        .await
        .unwrap();
    assert_eq!(session.total_chunks, 2);
    assert_eq!(reader.await.unwrap().unwrap(), data[500..]);
    h.stop().await;
}

#[tokio::test]
async fn cancelled_stream_ends_with_error() {
    let data = pattern(5000);
    let h = Harness::start(
        HostConfig {
            chunk_size: 1000,
            ..HostConfig::default()
        },
        &[("clip.bin", data.as_slice())],
    )
    .await;
    let config = ClientConfig {
        max_buffered_chunks: 1,
        ..client_config()
    };
    let client = PeerClient::connect(&h.net, "host", config, &NoPassphrase)
        .await
        .unwrap();

    let mut stream = client.begin_session("/clip.bin", None).await.unwrap();
    stream.cancel();

    let mut bytes = 0;
    let last = loop {
        match stream.recv().await {
            Some(SinkEvent::Data(chunk)) => bytes += chunk.len(),
            other => break other,
        }
    };
    // The abort notice is best effort; the stream never reports `End`.
    assert!(
        matches!(last, Some(SinkEvent::Error(_)) | None),
        "got {last:?}"
    );
    assert!(bytes < data.len());
    assert!(matches!(
        stream.finish().await,
        Err(ClientError::Cancelled(_))
    ));

    // The link is still usable afterwards.
    assert!(client.list_directory("/").await.is_ok());
    h.stop().await;
}

#[tokio::test]
async fn windowed_upload_is_stored_in_order() {
    let h = Harness::start(HostConfig::default().with_uploads(true), &[]).await;
    let client = h.connect(&NoPassphrase).await.unwrap();
    let data = pattern(2500);

    let options = UploadOptions {
        concurrent_uploads: 3,
        ..fast_retries()
    };
    let outcome = client
        .upload_file(&MemorySource::new("up.bin", data.clone()), &options)
        .await
        .unwrap();
    assert!(outcome.verified());
    assert_eq!(outcome.complete.size, 2500);
    assert_eq!(outcome.complete.file_name, "up.bin");

    assert_eq!(h.store.get_file("up.bin").await.unwrap(), Some(data));
    let lens: Vec<_> = h.store.writes().await.iter().map(|w| w.len).collect();
    assert_eq!(lens, vec![1000, 1000, 500]);
    h.stop().await;
}

#[tokio::test]
async fn upload_refused_when_disabled() {
    let h = Harness::start(HostConfig::default(), &[]).await;
    let client = h.connect(&NoPassphrase).await.unwrap();
    match client
        .upload_file(&MemorySource::new("up.bin", pattern(10)), &fast_retries())
        .await
    {
        Err(ClientError::Host { code, .. }) => assert_eq!(code, 403),
        other => panic!("unexpected {other:?}"),
    }
    h.stop().await;
}

/// Source whose first read waits for a signal.
struct GatedSource {
    inner: MemorySource,
    gate: Arc<Notify>,
    reading: Arc<Notify>,
}

impl UploadSource for GatedSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mime_type(&self) -> &str {
        self.inner.mime_type()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_range(&self, start: u64, end: u64) -> SinkFuture<'_, Result<Vec<u8>, TransferError>> {
        Box::pin(async move {
            self.reading.notify_one();
            self.gate.notified().await;
            self.inner.read_range(start, end).await
        })
    }
}

#[tokio::test]
async fn concurrent_upload_of_same_name_conflicts() {
    let h = Harness::start(HostConfig::default().with_uploads(true), &[]).await;
    let first = h.connect(&NoPassphrase).await.unwrap();
    let second = h.connect(&NoPassphrase).await.unwrap();

    let gate = Arc::new(Notify::new());
    let reading = Arc::new(Notify::new());
    let source = GatedSource {
        inner: MemorySource::new("same.bin", pattern(100)),
        gate: gate.clone(),
        reading: reading.clone(),
    };
    let pending = tokio::spawn(async move { first.upload_file(&source, &fast_retries()).await });

    // The first upload is registered once it starts reading chunk 0.
    reading.notified().await;
    match second
        .upload_file(&MemorySource::new("same.bin", pattern(100)), &fast_retries())
        .await
    {
        Err(ClientError::Host { code, .. }) => assert_eq!(code, 409),
        other => panic!("unexpected {other:?}"),
    }

    gate.notify_one();
    let outcome = pending.await.unwrap().unwrap();
    assert!(outcome.verified());
    h.stop().await;
}

#[tokio::test]
async fn shutdown_disconnects_clients() {
    let h = Harness::start(HostConfig::default(), &[]).await;
    let client = h.connect(&NoPassphrase).await.unwrap();
    assert!(client.is_connected().await);

    h.stop().await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.is_connected().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client should notice the host going away");
    assert!(matches!(
        client.list_directory("/").await,
        Err(ClientError::Closed)
    ));
}
