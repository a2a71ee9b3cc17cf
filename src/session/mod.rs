//! Client sessions: one per open handle on the device.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::{
    adaptor::{Completion, DriverError, Result, Writer},
    protocol::{record_count, CanFrame, ReceivedFrame, RECEIVED_FRAME_RECORD_SIZE},
};

mod buffers;
mod queue;

pub use buffers::MessageBufferPool;
pub use queue::{ClientReadQueue, ReadMode};

use queue::ReadOutcome;

/// Registered clients, in open order.
pub(crate) struct ClientList {
    clients: Mutex<Vec<(u64, Arc<ClientReadQueue>)>>,
    next_id: AtomicU64,
}

pub(crate) type ClientListGuard<'a> = MutexGuard<'a, Vec<(u64, Arc<ClientReadQueue>)>>;

impl ClientList {
    pub(crate) fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, queue: Arc<ClientReadQueue>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().push((id, queue));
        id
    }

    pub(crate) fn unregister(&self, id: u64) -> Option<Arc<ClientReadQueue>> {
        let mut clients = self.clients.lock();
        let position = clients.iter().position(|(client, _)| *client == id)?;
        Some(clients.remove(position).1)
    }

    /// Hold the list for a whole receive batch.
    pub(crate) fn lock(&self) -> ClientListGuard<'_> {
        self.clients.lock()
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.lock().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStats {
    /// Frames dropped for this client, by overflow or allocation failure.
    pub rx_lost: u64,
}

/// An open handle on the device.
///
/// Every session sees every received frame. Dropping it unregisters the
/// client and frees its buffered frames.
pub struct Session {
    id: u64,
    queue: Arc<ClientReadQueue>,
    clients: Arc<ClientList>,
    writer: Arc<Writer>,
}

impl Session {
    pub(crate) fn open(
        clients: Arc<ClientList>,
        writer: Arc<Writer>,
        buffers: Arc<MessageBufferPool>,
        capacity: usize,
    ) -> Self {
        let queue = Arc::new(ClientReadQueue::new(capacity, buffers));
        let id = clients.register(Arc::clone(&queue));
        log::debug!("session {} opened", id);
        Self {
            id,
            queue,
            clients,
            writer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Frames waiting to be read.
    pub fn buffered(&self) -> usize {
        self.queue.buffered()
    }

    pub fn stats(&self) -> FileStats {
        FileStats {
            rx_lost: self.queue.lost(),
        }
    }

    pub fn clear_stats(&self) {
        self.queue.clear_lost();
    }

    /// Read up to `count` frames. See [`ReadMode`] for when this waits.
    ///
    /// Dropping the returned request before it resolves cancels it.
    pub fn read(&self, count: usize, mode: ReadMode) -> ReadRequest<'_> {
        let state = match self.queue.read(count, mode) {
            Ok(ReadOutcome::Ready(frames)) => ReadState::Ready(Some(Ok(frames))),
            Ok(ReadOutcome::Pending { id, receiver }) => ReadState::Pending { id, receiver },
            Err(e) => ReadState::Ready(Some(Err(e))),
        };
        ReadRequest {
            session: self,
            state,
        }
    }

    /// Read into a buffer of [`ReceivedFrame`] records. The buffer length
    /// must be a multiple of the record size.
    pub async fn read_bytes(&self, buf: &mut [u8], mode: ReadMode) -> Result<usize> {
        let count = record_count(buf.len(), RECEIVED_FRAME_RECORD_SIZE)?;
        let frames = self.read(count, mode).await?;
        ReceivedFrame::write_records(&frames, buf)
    }

    /// Transmit up to 16 frames as one request.
    pub async fn write(&self, frames: &[CanFrame]) -> Completion {
        self.writer.write_frames(frames).await
    }

    /// Transmit a buffer of [`CanFrame`] records.
    pub async fn write_bytes(&self, buf: &[u8]) -> Completion {
        match CanFrame::from_records(buf) {
            Ok(frames) => self.write(&frames).await,
            Err(e) => Completion::failed(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.clients.unregister(self.id).is_none() {
            log::warn!("session {} was not registered", self.id);
        }
        self.queue.close();
        log::debug!("session {} closed", self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("buffered", &self.queue.buffered())
            .finish()
    }
}

enum ReadState {
    Ready(Option<Result<Vec<ReceivedFrame>>>),
    Pending {
        id: u64,
        receiver: oneshot::Receiver<Result<Vec<ReceivedFrame>>>,
    },
    Done,
}

/// A read in progress on a [`Session`].
///
/// The borrow keeps the session open while the read is outstanding.
#[must_use = "a read does nothing unless polled and is cancelled when dropped"]
pub struct ReadRequest<'a> {
    session: &'a Session,
    state: ReadState,
}

impl ReadRequest<'_> {
    /// Handle that cancels this read from elsewhere. `None` when the read
    /// did not need to wait.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        match &self.state {
            ReadState::Pending { id, .. } => Some(CancelHandle {
                queue: Arc::downgrade(&self.session.queue),
                id: *id,
            }),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ReadState::Pending { .. })
    }
}

impl Future for ReadRequest<'_> {
    type Output = Result<Vec<ReceivedFrame>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = match &mut this.state {
            ReadState::Ready(result) => result.take().unwrap_or_else(polled_after_completion),
            ReadState::Pending { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(result) => result.unwrap_or(Err(DriverError::Cancelled)),
                Poll::Pending => return Poll::Pending,
            },
            ReadState::Done => polled_after_completion(),
        };
        this.state = ReadState::Done;
        Poll::Ready(result)
    }
}

fn polled_after_completion() -> Result<Vec<ReceivedFrame>> {
    Err(DriverError::InvalidArgument("read polled after completion".into()))
}

impl Drop for ReadRequest<'_> {
    fn drop(&mut self) {
        if let ReadState::Pending { id, .. } = self.state {
            self.session.queue.cancel(id);
        }
    }
}

/// Cancels one pending read.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    queue: Weak<ClientReadQueue>,
    id: u64,
}

impl CancelHandle {
    /// Returns false when the read already completed.
    pub fn cancel(&self) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|queue| queue.cancel(self.id))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adaptor::{channel_pair, EmulatorConfig, UsbTransport};
    use crate::protocol::Codec;

    fn open(clients: &Arc<ClientList>) -> Session {
        let (channel, _emulator) = channel_pair(8, EmulatorConfig::default()).unwrap();
        let transport: Arc<dyn UsbTransport> = Arc::new(channel);
        let writer = Arc::new(Writer::new(transport, 16, Codec::detect().unwrap()).unwrap());
        Session::open(
            Arc::clone(clients),
            writer,
            Arc::new(MessageBufferPool::new(4096, None)),
            16,
        )
    }

    fn received(n: u16) -> ReceivedFrame {
        ReceivedFrame::new(CanFrame::new_standard(n, &[1, 2]).unwrap(), 42)
    }

    #[tokio::test]
    async fn test_register_and_close() {
        let clients = Arc::new(ClientList::new());
        let a = open(&clients);
        let b = open(&clients);
        assert_ne!(a.id(), b.id());
        assert_eq!(clients.len(), 2);
        drop(a);
        assert_eq!(clients.len(), 1);
        assert_eq!(clients.lock()[0].0, b.id());
    }

    #[tokio::test]
    async fn test_dropping_read_cancels() {
        let clients = Arc::new(ClientList::new());
        let session = open(&clients);
        {
            let read = session.read(1, ReadMode::ReadAtLeastOne);
            assert!(read.is_pending());
            let timed_out = tokio::time::timeout(Duration::from_millis(10), read).await;
            assert!(timed_out.is_err());
        }
        assert!(!session.queue.has_pending_read());
        // a fresh blocking read is accepted again
        let read = session.read(1, ReadMode::ReadAtLeastOne);
        assert!(read.is_pending());
        clients.lock()[0].1.push(received(3));
        assert_eq!(read.await.unwrap(), vec![received(3)]);
    }

    #[tokio::test]
    async fn test_cancel_handle() {
        let clients = Arc::new(ClientList::new());
        let session = open(&clients);
        let read = session.read(2, ReadMode::ReadAll);
        let handle = read.cancel_handle().unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(read.await, Err(DriverError::Cancelled));
    }

    #[tokio::test]
    async fn test_read_bytes() {
        let clients = Arc::new(ClientList::new());
        let session = open(&clients);
        clients.lock()[0].1.push(received(5));

        let mut buf = [0u8; 2 * RECEIVED_FRAME_RECORD_SIZE];
        let n = session.read_bytes(&mut buf, ReadMode::NonBlocking).await.unwrap();
        assert_eq!(n, RECEIVED_FRAME_RECORD_SIZE);
        assert_eq!(&buf[..16], &received(5).frame.to_record());

        let frames = session.read(usize::MAX, ReadMode::NonBlocking).await.unwrap();
        assert!(frames.is_empty());

        let mut odd = [0u8; 25];
        assert!(matches!(
            session.read_bytes(&mut odd, ReadMode::NonBlocking).await,
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.write_bytes(&[0u8; 15]).await.status,
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let clients = Arc::new(ClientList::new());
        let session = open(&clients);
        for n in 0..20 {
            clients.lock()[0].1.push(received(n));
        }
        assert_eq!(session.stats(), FileStats { rx_lost: 4 });
        assert_eq!(session.buffered(), 16);
        session.clear_stats();
        assert_eq!(session.stats().rx_lost, 0);
    }
}
