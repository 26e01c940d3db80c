//! Write pump: encodes outbound messages onto the channel.

use peershare_link::{ChannelWriter, EnvelopeCodec};
use peershare_protocol::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Writes queued messages until cancelled or the queue closes, then
/// tells the host the link is closing.
pub(crate) async fn write_pump(
    writer: ChannelWriter,
    mut write_rx: mpsc::Receiver<Message>,
    codec: EnvelopeCodec,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(msg) = msg else { break };
                let frame = match codec.encode(&msg).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(msg_type = ?msg.msg_type, "failed to encode message: {e}");
                        continue;
                    }
                };
                trace!(msg_type = ?msg.msg_type, "sending");
                if let Err(e) = writer.send(frame).await {
                    error!("channel write error: {e}");
                    break;
                }
            }
        }
    }

    writer.close().await;
}
