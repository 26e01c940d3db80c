//! Wires a host and a client together over the in-memory transport.

use std::sync::Arc;

use peershare_client::{
    ClientConfig, FixedPassphrase, NoPassphrase, PassphrasePrompt, PeerClient, UploadOptions,
};
use peershare_host::{DirBlobStore, HostConfig, HostServer, LocalFileSystem};
use peershare_link::MemoryNetwork;
use peershare_transfer::MemorySource;

use crate::config::Config;

/// Shares `config.share_dir`, downloads every top-level file through a
/// client and optionally uploads each one back.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let host_config = HostConfig {
        name: config.name.clone(),
        passphrase: config.passphrase().map(str::to_string),
        allow_uploads: config.allow_uploads,
        chunk_size: config.chunk_size,
        ..HostConfig::default()
    };

    std::fs::create_dir_all(&config.upload_dir)?;
    let fs = Arc::new(LocalFileSystem::new(&config.share_dir)?);
    let store = Arc::new(DirBlobStore::new(&config.upload_dir));
    let server = HostServer::share(&host_config, fs, store);

    let net = MemoryNetwork::default();
    let listener = net.listen(&config.name).await?;
    let server_run = Arc::clone(&server);
    let host_task = tokio::spawn(async move {
        if let Err(e) = server_run.run(listener).await {
            tracing::error!("host error: {e}");
        }
    });

    let prompt: Box<dyn PassphrasePrompt> = match config.passphrase() {
        Some(p) => Box::new(FixedPassphrase::new(p)),
        None => Box::new(NoPassphrase),
    };
    let result = exercise(&net, &config, prompt.as_ref()).await;

    server.shutdown();
    host_task.await?;
    result
}

async fn exercise(
    net: &MemoryNetwork,
    config: &Config,
    prompt: &dyn PassphrasePrompt,
) -> anyhow::Result<()> {
    let client = PeerClient::connect(net, &config.name, ClientConfig::default(), prompt).await?;
    let features = client.features().clone();
    tracing::info!(
        host = %features.name,
        encrypted = features.encrypted,
        uploads = features.upload_allowed,
        "connected"
    );

    let listing = client.list_directory("/").await?;
    tracing::info!(entries = listing.entries.len(), "listed shared root");

    for entry in listing.entries.iter().filter(|e| !e.is_directory) {
        let stream = client.begin_session(&entry.path, None).await?;
        let name = stream.name().to_string();
        let mime_type = stream.mime_type().to_string();
        let data = stream.read_to_end().await?;
        tracing::info!(file = %name, bytes = data.len(), "downloaded");

        if !(config.reupload && features.upload_allowed) {
            continue;
        }
        let source = MemorySource::new(format!("copy-{name}"), data).with_mime_type(mime_type);
        let outcome = client
            .upload_file(&source, &UploadOptions::default())
            .await?;
        if outcome.verified() {
            tracing::info!(file = %outcome.complete.file_name, "re-uploaded");
        } else {
            tracing::warn!(file = %outcome.complete.file_name, "re-upload checksum differs");
        }
    }

    client.close();
    Ok(())
}
