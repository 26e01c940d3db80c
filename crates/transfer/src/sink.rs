use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::TransferError;

/// Boxed future returned by [`ByteSink`] methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ordered, backpressured destination for transfer bytes.
///
/// Writers call [`ready`](ByteSink::ready) before each
/// [`write`](ByteSink::write); it resolves once the consumer has room.
/// A sink ends with exactly one of [`close`](ByteSink::close) or
/// [`abort`](ByteSink::abort).
pub trait ByteSink: Send {
    fn ready(&mut self) -> SinkFuture<'_, Result<(), TransferError>>;

    fn write(&mut self, data: Vec<u8>) -> SinkFuture<'_, Result<(), TransferError>>;

    fn close(&mut self) -> SinkFuture<'_, Result<(), TransferError>>;

    fn abort(&mut self, reason: String) -> SinkFuture<'_, ()>;

    /// `false` once the sink was closed, aborted, or its consumer went away.
    fn is_accepting(&self) -> bool;
}

impl<S: ByteSink + ?Sized> ByteSink for Box<S> {
    fn ready(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        (**self).ready()
    }

    fn write(&mut self, data: Vec<u8>) -> SinkFuture<'_, Result<(), TransferError>> {
        (**self).write(data)
    }

    fn close(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        (**self).close()
    }

    fn abort(&mut self, reason: String) -> SinkFuture<'_, ()> {
        (**self).abort(reason)
    }

    fn is_accepting(&self) -> bool {
        (**self).is_accepting()
    }
}

/// Item delivered to a [`SinkReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Data(Vec<u8>),
    End,
    Error(String),
}

/// Creates a bounded sink/receiver pair. At most `capacity` writes are
/// buffered before [`ByteSink::ready`] blocks.
pub fn channel_sink(capacity: usize) -> (ChannelSink, SinkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink {
            tx,
            permit: None,
            finished: false,
        },
        SinkReceiver { rx },
    )
}

/// Producer half of [`channel_sink`].
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
    permit: Option<mpsc::OwnedPermit<SinkEvent>>,
    finished: bool,
}

impl ChannelSink {
    async fn reserve(&mut self) -> Result<(), TransferError> {
        if self.finished {
            return Err(TransferError::SinkClosed);
        }
        if self.permit.is_none() {
            let permit = self
                .tx
                .clone()
                .reserve_owned()
                .await
                .map_err(|_| TransferError::SinkAborted("consumer went away".into()))?;
            self.permit = Some(permit);
        }
        Ok(())
    }
}

impl ByteSink for ChannelSink {
    fn ready(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        Box::pin(self.reserve())
    }

    fn write(&mut self, data: Vec<u8>) -> SinkFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            self.reserve().await?;
            match self.permit.take() {
                Some(permit) => {
                    permit.send(SinkEvent::Data(data));
                    Ok(())
                }
                None => Err(TransferError::SinkClosed),
            }
        })
    }

    fn close(&mut self) -> SinkFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            self.reserve().await?;
            self.finished = true;
            match self.permit.take() {
                Some(permit) => {
                    permit.send(SinkEvent::End);
                    Ok(())
                }
                None => Err(TransferError::SinkClosed),
            }
        })
    }

    fn abort(&mut self, reason: String) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            if self.finished {
                return;
            }
            self.finished = true;
            // Best effort: a full or closed channel just drops the notice.
            match self.permit.take() {
                Some(permit) => {
                    permit.send(SinkEvent::Error(reason));
                }
                None => {
                    let _ = self.tx.try_send(SinkEvent::Error(reason));
                }
            }
        })
    }

    fn is_accepting(&self) -> bool {
        !self.finished && !self.tx.is_closed()
    }
}

/// Consumer half of [`channel_sink`]. Dropping it aborts the producer.
pub struct SinkReceiver {
    rx: mpsc::Receiver<SinkEvent>,
}

impl SinkReceiver {
    /// Next event; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<SinkEvent> {
        self.rx.recv().await
    }

    /// Stops accepting data. The producer sees the sink as no longer
    /// accepting on its next chunk.
    pub fn cancel(&mut self) {
        self.rx.close();
    }

    /// Collects every data event until `End`.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::new();
        loop {
            match self.rx.recv().await {
                Some(SinkEvent::Data(data)) => out.extend_from_slice(&data),
                Some(SinkEvent::End) => return Ok(out),
                Some(SinkEvent::Error(reason)) => return Err(TransferError::SinkAborted(reason)),
                None => return Err(TransferError::SinkAborted("producer went away".into())),
            }
        }
    }
}
