//! Read pump: decodes inbound frames and routes them.

use std::sync::Arc;

use peershare_link::{Admission, ChannelEvent, ChannelReader, LinkError, PhaseEvent};
use peershare_protocol::messages::FileUploadComplete;
use peershare_protocol::{Message, MessageType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::Shared;

/// Reads frames until the channel closes or `cancel` fires, then tears
/// the link down: outstanding requests are rejected, upload waiters are
/// dropped and running transfers see the cancellation.
pub(crate) async fn read_pump(
    mut reader: ChannelReader,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = reader.recv() => event,
        };
        match event {
            ChannelEvent::Data(frame) => handle_frame(&frame, &shared).await,
            ChannelEvent::Closed => {
                debug!("host closed the link");
                break;
            }
            ChannelEvent::Error(e) => {
                warn!("channel read error: {e}");
                break;
            }
        }
    }

    let _ = shared.phase.lock().await.apply(PhaseEvent::TransportClosed);
    let rejected = shared.correlator.fail_all().await;
    shared.upload_waiters.lock().await.clear();
    shared.codec.key().clear().await;
    cancel.cancel();
    info!(rejected, "link closed");

    if let Some(cb) = shared.on_disconnect.lock().await.as_ref() {
        cb();
    }
}

/// Handles one inbound frame.
pub(crate) async fn handle_frame(frame: &[u8], shared: &Shared) {
    let msg = match shared.codec.decode(frame).await {
        Ok(decoded) => decoded.message,
        Err(e) => {
            warn!("dropping undecodable frame: {e}");
            return;
        }
    };

    let (admission, phase) = {
        let machine = shared.phase.lock().await;
        (machine.admit(msg.msg_type), machine.phase())
    };
    if admission != Admission::Accept {
        warn!(msg_type = ?msg.msg_type, ?admission, "message not valid in this phase");
        if let Some(id) = msg.correlation_id.as_deref() {
            let err = LinkError::WrongPhase {
                phase,
                msg_type: msg.msg_type,
            };
            shared.correlator.reject(id, err.into()).await;
        }
        return;
    }
    trace!(msg_type = ?msg.msg_type, correlation_id = ?msg.correlation_id, "received message");

    // Route response to pending request.
    let Some(msg) = shared.correlator.resolve(msg).await else {
        return;
    };

    if msg.msg_type == MessageType::FileUploadComplete
        && let Ok(Some(done)) = msg.parse_payload::<FileUploadComplete>()
    {
        let waiter = shared.upload_waiters.lock().await.remove(&done.upload_id);
        if let Some(tx) = waiter {
            let _ = tx.send(done);
            return;
        }
    }

    if let Some(err) = msg.error_payload() {
        warn!(code = err.code, "uncorrelated error from host: {}", err.message);
    }
    dispatch_event(msg, shared).await;
}

async fn dispatch_event(msg: Message, shared: &Shared) {
    let guard = shared.on_event.lock().await;
    if let Some(cb) = guard.as_ref() {
        cb(msg.msg_type, msg);
    } else {
        debug!(msg_type = ?msg.msg_type, "no event callback set, dropping push event");
    }
}
