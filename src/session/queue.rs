use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    adaptor::{DriverError, Result},
    protocol::ReceivedFrame,
};

use super::buffers::{ItemIndex, MessageBufferPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait until the whole request is filled.
    ReadAll,
    /// Wait for at least one frame.
    ReadAtLeastOne,
    /// Return whatever is buffered, possibly nothing.
    NonBlocking,
}

pub(crate) type ReadResponder = oneshot::Sender<Result<Vec<ReceivedFrame>>>;

struct PendingRead {
    id: u64,
    frames: Vec<ReceivedFrame>,
    count: usize,
    responder: ReadResponder,
}

struct QueueState {
    buffered: VecDeque<ItemIndex>,
    lost: u64,
    pending: Option<PendingRead>,
    next_read_id: u64,
}

pub(crate) enum ReadOutcome {
    Ready(Vec<ReceivedFrame>),
    Pending {
        id: u64,
        receiver: oneshot::Receiver<Result<Vec<ReceivedFrame>>>,
    },
}

/// Received frames of one client.
///
/// New frames go to an armed pending read first and to the bounded buffer
/// otherwise. A full buffer drops its oldest frame.
pub struct ClientReadQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    pool: Arc<MessageBufferPool>,
}

impl ClientReadQueue {
    pub fn new(capacity: usize, pool: Arc<MessageBufferPool>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffered: VecDeque::with_capacity(capacity),
                lost: 0,
                pending: None,
                next_read_id: 0,
            }),
            capacity,
            pool,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffered.len()
    }

    pub fn lost(&self) -> u64 {
        self.state.lock().lost
    }

    pub fn clear_lost(&self) {
        self.state.lock().lost = 0;
    }

    pub fn has_pending_read(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    pub fn push(&self, frame: ReceivedFrame) {
        let mut state = self.state.lock();

        if let Some(pending) = state.pending.as_mut() {
            pending.frames.push(frame);
            if pending.frames.len() < pending.count {
                return;
            }
            let finished = state.pending.take();
            drop(state);
            if let Some(finished) = finished {
                log::trace!(
                    "pending read {} filled with {} frames",
                    finished.id,
                    finished.frames.len()
                );
                let _ = finished.responder.send(Ok(finished.frames));
            }
            return;
        }

        if state.buffered.len() >= self.capacity {
            if let Some(oldest) = state.buffered.pop_front() {
                self.pool.overwrite(oldest, frame);
                state.buffered.push_back(oldest);
                state.lost += 1;
                log::warn!("client queue full, dropped oldest frame");
                return;
            }
        }

        match self.pool.store(frame) {
            Ok(index) => state.buffered.push_back(index),
            Err(e) => {
                state.lost += 1;
                log::warn!("dropped received frame: {}", e);
            }
        }
    }

    /// Drain up to `want` buffered frames. When more are needed and `mode`
    /// allows waiting, arm a pending read that later pushes complete.
    pub(crate) fn read(&self, want: usize, mode: ReadMode) -> Result<ReadOutcome> {
        if want == 0 {
            return Ok(ReadOutcome::Ready(Vec::new()));
        }

        let mut state = self.state.lock();
        let mut frames = Vec::with_capacity(want.min(state.buffered.len()));
        while frames.len() < want {
            let Some(index) = state.buffered.pop_front() else {
                break;
            };
            frames.push(self.pool.take(index));
        }

        if frames.len() == want {
            return Ok(ReadOutcome::Ready(frames));
        }
        match mode {
            ReadMode::NonBlocking => return Ok(ReadOutcome::Ready(frames)),
            ReadMode::ReadAtLeastOne if !frames.is_empty() => {
                return Ok(ReadOutcome::Ready(frames))
            }
            _ => {}
        }

        if state.pending.is_some() {
            // An armed read means nothing was buffered.
            debug_assert!(frames.is_empty());
            log::error!("a blocking read is already pending");
            return Err(DriverError::ReadAlreadyPending);
        }

        let count = match mode {
            ReadMode::ReadAll => want,
            _ => frames.len() + 1,
        };
        let id = state.next_read_id;
        state.next_read_id = state.next_read_id.wrapping_add(1);
        let (responder, receiver) = oneshot::channel();
        log::trace!(
            "read {} pending with {} of {} frames",
            id,
            frames.len(),
            count
        );
        state.pending = Some(PendingRead {
            id,
            frames,
            count,
            responder,
        });
        Ok(ReadOutcome::Pending { id, receiver })
    }

    /// Cancel the pending read `id`. Returns false when a push already
    /// completed it. Frames already placed in the read are discarded.
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if !matches!(&state.pending, Some(pending) if pending.id == id) {
            return false;
        }
        let cancelled = state.pending.take();
        drop(state);
        if let Some(cancelled) = cancelled {
            log::info!("pending read {} was cancelled", cancelled.id);
            let _ = cancelled.responder.send(Err(DriverError::Cancelled));
        }
        true
    }

    /// Return every buffered frame to the shared pool.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending.is_none(), "client closed with a pending read");
        if let Some(pending) = state.pending.take() {
            let _ = pending.responder.send(Err(DriverError::Cancelled));
        }
        let buffered = std::mem::take(&mut state.buffered);
        drop(state);
        self.pool.release_all(buffered);
    }
}

impl Drop for ClientReadQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let buffered = std::mem::take(&mut state.buffered);
        self.pool.release_all(buffered);
    }
}
