//! In-flight requests keyed by correlation id.

use std::collections::HashMap;
use std::time::Duration;

use peershare_protocol::Message;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace};

use crate::ClientError;

/// What a waiter receives: the response, or a local rejection.
pub(crate) type Reply = Result<Message, ClientError>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Matches responses to the requests that are waiting for them.
///
/// Entries leave the map on response, on timeout and on teardown alike,
/// so a late response for a cleared id finds nothing and is dropped.
#[derive(Default)]
pub(crate) struct Correlator {
    pending: Mutex<Pending>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`. Fails once the link has been torn down.
    pub async fn register(&self, id: &str) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let mut pending = self.pending.lock().await;
        if pending.closed {
            return Err(ClientError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(id.to_string(), tx);
        Ok(rx)
    }

    pub async fn remove(&self, id: &str) {
        self.pending.lock().await.waiters.remove(id);
    }

    /// Waits for the response registered under `id`, then clears the entry
    /// whatever the outcome. A host `ERROR` becomes [`ClientError::Host`].
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.remove(id).await;

        match result {
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(resp))) => {
                if let Some(err) = resp.error_payload() {
                    return Err(ClientError::Host {
                        code: err.code,
                        message: err.message,
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                debug!(correlation_id = %id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Hands `msg` to its waiter. Returns it back when nobody waits for it.
    pub async fn resolve(&self, msg: Message) -> Option<Message> {
        let Some(id) = msg.correlation_id.as_deref() else {
            return Some(msg);
        };
        let tx = self.pending.lock().await.waiters.remove(id);
        match tx {
            Some(tx) => {
                trace!(correlation_id = %id, msg_type = ?msg.msg_type, "response matched");
                let _ = tx.send(Ok(msg));
                None
            }
            None => Some(msg),
        }
    }

    /// Fails the request waiting under `id` with `err`. Returns `false`
    /// when nobody waits for it.
    pub async fn reject(&self, id: &str, err: ClientError) -> bool {
        let tx = self.pending.lock().await.waiters.remove(id);
        match tx {
            Some(tx) => {
                debug!(correlation_id = %id, "request rejected: {err}");
                let _ = tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Rejects every outstanding request with [`ClientError::Closed`] and
    /// refuses new ones.
    pub async fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        let n = pending.waiters.len();
        // Dropping the senders wakes every waiter with a receive error.
        pending.waiters.clear();
        n
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.waiters.len()
    }
}
