use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{
        mpsc::{Receiver, Sender},
        Mutex as AsyncMutex,
    },
    task::JoinHandle,
};

use super::{BulkInSink, DriverError, Result, SubmitError, UsbTransport, WriteCompletion};
use crate::protocol::UsbMessage;

/// One bulk-out transfer in flight on a [`Channel`].
///
/// Whoever receives it owns the completion and must call
/// [`WriteCompletion::complete`].
#[derive(Debug)]
pub struct OutboundTransfer {
    pub message: UsbMessage,
    pub completion: WriteCompletion,
}

/// In-process transport: bulk-out transfers go into one channel and bulk-in
/// payloads come out of another.
#[derive(Clone)]
pub struct Channel(Arc<ChannelInner>);

struct ChannelInner {
    tx: Sender<OutboundTransfer>,
    rx: Arc<AsyncMutex<Receiver<Vec<u8>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Channel {
    pub fn new(tx: Sender<OutboundTransfer>, rx: Receiver<Vec<u8>>) -> Self {
        Self(Arc::new(ChannelInner {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            reader: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn is_stopped(&self) -> bool {
        self.0.stopped.load(Ordering::Acquire)
    }
}

#[async_trait]
impl UsbTransport for Channel {
    async fn submit_write(
        &self,
        message: UsbMessage,
        completion: WriteCompletion,
    ) -> std::result::Result<(), SubmitError> {
        if self.is_stopped() {
            return Err(SubmitError::new(DriverError::DeviceStopped, completion));
        }
        self.0
            .tx
            .send(OutboundTransfer {
                message,
                completion,
            })
            .await
            .map_err(|e| SubmitError::new(DriverError::DeviceStopped, e.0.completion))
    }

    /// The reader can be started again after [`UsbTransport::stop_pipes`].
    fn start_continuous_read(&self, sink: BulkInSink) -> Result<()> {
        let mut reader = self.0.reader.lock();
        if reader.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(DriverError::TransportFailure(
                "bulk-in reader already running".into(),
            ));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| DriverError::TransportFailure(e.to_string()))?;

        let rx = Arc::clone(&self.0.rx);
        *reader = Some(handle.spawn(async move {
            // Released when the task is aborted.
            let mut rx = rx.lock().await;
            while let Some(payload) = rx.recv().await {
                if !sink.deliver(&payload) {
                    break;
                }
            }
            log::debug!("bulk-in reader finished");
        }));
        self.0.stopped.store(false, Ordering::Release);
        Ok(())
    }

    async fn stop_pipes(&self) {
        self.0.stopped.store(true, Ordering::Release);
        let task = self.0.reader.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        demux::ReceiveDemux,
        protocol::{CanFrame, Codec, CommandId, DeviceStatus},
        session::{ClientList, ClientReadQueue, MessageBufferPool},
    };

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let channel = Channel::new(out_tx, in_rx);

        let codec = Codec::detect().unwrap();
        let clients = Arc::new(ClientList::new());
        let queue = Arc::new(ClientReadQueue::new(
            8,
            Arc::new(MessageBufferPool::new(4096, None)),
        ));
        clients.register(Arc::clone(&queue));
        let demux = Arc::new(ReceiveDemux::new(
            codec,
            Arc::new(Mutex::new(DeviceStatus::default())),
            clients,
        ));
        let sink = || BulkInSink::new(Arc::downgrade(&demux));

        channel.start_continuous_read(sink()).unwrap();
        assert!(matches!(
            channel.start_continuous_read(sink()),
            Err(DriverError::TransportFailure(_))
        ));
        channel.stop_pipes().await;
        assert!(channel.is_stopped());

        channel.start_continuous_read(sink()).unwrap();
        assert!(!channel.is_stopped());

        let frame = CanFrame::new_standard(5, &[1]).unwrap();
        let mut msg = *codec.encode_can_frame(&frame).as_bytes();
        msg[0] = CommandId::ReceiveMessage.into();
        in_tx.send(msg.to_vec()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.buffered() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        channel.stop_pipes().await;
    }
}
