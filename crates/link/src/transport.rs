//! Point-to-point byte channels.
//!
//! A real data-channel transport (and its signalling) lives outside this
//! workspace; it plugs in by implementing [`PeerTransport`] and bridging
//! its socket into a [`PeerChannel`]. [`MemoryNetwork`] is the in-process
//! implementation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::LinkError;

/// Default channel depth for [`MemoryNetwork`] links.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Boxed future returned by [`PeerTransport`].
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Item read from a [`PeerChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    Closed,
    Error(String),
}

/// Outbound connection capability.
pub trait PeerTransport: Send + Sync {
    fn connect<'a>(&'a self, peer_id: &'a str)
    -> TransportFuture<'a, Result<PeerChannel, LinkError>>;
}

/// One end of a bidirectional byte channel.
pub struct PeerChannel {
    peer_id: String,
    outgoing: mpsc::Sender<ChannelEvent>,
    incoming: mpsc::Receiver<ChannelEvent>,
}

impl PeerChannel {
    /// Creates a connected pair: `a` talks to a peer named `b_id` and
    /// vice versa.
    pub fn pair(a_id: &str, b_id: &str, capacity: usize) -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        (
            PeerChannel {
                peer_id: b_id.to_string(),
                outgoing: b_tx,
                incoming: a_rx,
            },
            PeerChannel {
                peer_id: a_id.to_string(),
                outgoing: a_tx,
                incoming: b_rx,
            },
        )
    }

    /// Builds a channel from raw parts, for adapters bridging an external
    /// transport.
    pub fn from_parts(
        peer_id: impl Into<String>,
        outgoing: mpsc::Sender<ChannelEvent>,
        incoming: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            outgoing,
            incoming,
        }
    }

    /// Identifier of the remote end.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn split(self) -> (ChannelWriter, ChannelReader) {
        (
            ChannelWriter {
                tx: self.outgoing,
            },
            ChannelReader {
                rx: self.incoming,
            },
        )
    }
}

/// Sending half of a [`PeerChannel`].
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::Sender<ChannelEvent>,
}

impl ChannelWriter {
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        self.tx
            .send(ChannelEvent::Data(frame))
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Tells the remote end the link is closing.
    pub async fn close(&self) {
        let _ = self.tx.send(ChannelEvent::Closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`PeerChannel`].
pub struct ChannelReader {
    rx: mpsc::Receiver<ChannelEvent>,
}

impl ChannelReader {
    /// Next event. A vanished remote reads as [`ChannelEvent::Closed`].
    pub async fn recv(&mut self) -> ChannelEvent {
        self.rx.recv().await.unwrap_or(ChannelEvent::Closed)
    }
}

/// Accepts inbound channels for one peer id.
pub struct PeerListener {
    id: String,
    rx: mpsc::Receiver<PeerChannel>,
    network: MemoryNetwork,
}

impl PeerListener {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next inbound channel; `None` once the network is gone.
    pub async fn accept(&mut self) -> Option<PeerChannel> {
        self.rx.recv().await
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        let listeners = self.network.listeners.clone();
        let id = std::mem::take(&mut self.id);
        if let Ok(mut map) = listeners.try_lock() {
            map.remove(&id);
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                listeners.lock().await.remove(&id);
            });
        }
    }
}

/// In-process [`PeerTransport`]: peers register with
/// [`listen`](MemoryNetwork::listen) and connect by id.
#[derive(Clone)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<PeerChannel>>>>,
    next_client: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl MemoryNetwork {
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_client: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    pub async fn listen(&self, peer_id: &str) -> Result<PeerListener, LinkError> {
        let mut map = self.listeners.lock().await;
        if map.contains_key(peer_id) {
            return Err(LinkError::AddrInUse(peer_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        map.insert(peer_id.to_string(), tx);
        Ok(PeerListener {
            id: peer_id.to_string(),
            rx,
            network: self.clone(),
        })
    }
}

impl PeerTransport for MemoryNetwork {
    fn connect<'a>(
        &'a self,
        peer_id: &'a str,
    ) -> TransportFuture<'a, Result<PeerChannel, LinkError>> {
        Box::pin(async move {
            let accept_tx = self
                .listeners
                .lock()
                .await
                .get(peer_id)
                .cloned()
                .ok_or_else(|| LinkError::PeerNotFound(peer_id.to_string()))?;

            let n = self.next_client.fetch_add(1, Ordering::Relaxed);
            let client_id = format!("client-{n}");
            let (local, remote) = PeerChannel::pair(&client_id, peer_id, self.capacity);

            accept_tx
                .send(remote)
                .await
                .map_err(|_| LinkError::PeerNotFound(peer_id.to_string()))?;
            debug!(peer = %peer_id, client = %client_id, "memory link established");
            Ok(local)
        })
    }
}
