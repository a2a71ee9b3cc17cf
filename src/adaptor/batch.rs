//! Fan-out and fan-in for multi-frame writes.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::CAN_FRAME_RECORD_SIZE;

use super::{
    slot::{SlotSet, MAX_SLOTS},
    Completion, Result,
};

pub const MAX_BATCH_FRAMES: usize = MAX_SLOTS;

struct BatchState {
    responder: Option<oneshot::Sender<Completion>>,
    count: usize,
    statuses: [Result<()>; MAX_BATCH_FRAMES],
    slots: SlotSet,
}

/// One multi-frame write in flight.
///
/// `pending` starts at the frame count. Every settled frame takes one off;
/// the caller that brings it to zero owns finalization.
pub(crate) struct BatchRequest {
    pending: AtomicUsize,
    state: Mutex<BatchState>,
}

impl BatchRequest {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            state: Mutex::new(BatchState {
                responder: None,
                count: 0,
                statuses: std::array::from_fn(|_| Ok(())),
                slots: SlotSet::new(),
            }),
        }
    }

    pub(crate) fn arm(&self, responder: oneshot::Sender<Completion>, slots: SlotSet) {
        let mut state = self.state.lock();
        debug_assert!(state.responder.is_none());
        state.count = slots.len();
        state.statuses.iter_mut().for_each(|status| *status = Ok(()));
        state.responder = Some(responder);
        state.slots = slots;
        self.pending.store(state.count, Ordering::Release);
    }

    /// Record the result of the frame at `position` without settling it.
    /// Used for a submission that failed before any transfer existed.
    pub(crate) fn record_unsent(&self, position: usize, status: Result<()>) {
        if let Some(slot) = self.state.lock().statuses.get_mut(position) {
            *slot = status;
        }
    }

    /// Settle the frame at `position`. Returns true for exactly one caller:
    /// the one whose decrement reached zero.
    pub(crate) fn complete_frame(&self, position: usize, status: Result<()>) -> bool {
        if let Some(slot) = self.state.lock().statuses.get_mut(position) {
            *slot = status;
        }
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Settle `unsent` frames that were never submitted. Returns true when
    /// this adjustment reached zero.
    pub(crate) fn settle_unsent(&self, unsent: usize) -> bool {
        unsent != 0 && self.pending.fetch_sub(unsent, Ordering::AcqRel) == unsent
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Build the write's completion and hand back its responder and slots.
    ///
    /// The status is the first failure in frame order; the byte count
    /// covers the frames before it.
    pub(crate) fn finish(&self) -> (Option<oneshot::Sender<Completion>>, Completion, SlotSet) {
        let mut state = self.state.lock();
        let mut status = Ok(());
        let mut transferred = 0;
        for frame_status in state.statuses.iter().take(state.count) {
            if let Err(e) = frame_status {
                status = Err(e.clone());
                break;
            }
            transferred += CAN_FRAME_RECORD_SIZE;
        }
        let responder = state.responder.take();
        let slots = std::mem::take(&mut state.slots);
        state.count = 0;
        (responder, Completion { status, transferred }, slots)
    }
}

/// Recycled batch records.
pub(crate) struct BatchFreeList {
    free: Mutex<Vec<Arc<BatchRequest>>>,
    allocated: AtomicUsize,
}

impl BatchFreeList {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    pub(crate) fn pop(&self) -> Arc<BatchRequest> {
        if let Some(batch) = self.free.lock().pop() {
            return batch;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Arc::new(BatchRequest::new())
    }

    pub(crate) fn push(&self, batch: Arc<BatchRequest>) {
        debug_assert_eq!(batch.pending(), 0);
        self.free.lock().push(batch);
    }

    /// Batch records created so far.
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::adaptor::DriverError;

    #[test]
    fn test_finish_stops_at_first_failure() {
        let batch = BatchRequest::new();
        let (tx, _rx) = oneshot::channel();
        batch.arm(tx, smallvec![0, 1, 2, 3]);
        assert!(!batch.complete_frame(2, Err(DriverError::Cancelled)));
        assert!(!batch.complete_frame(0, Ok(())));
        assert!(!batch.complete_frame(3, Ok(())));
        assert!(batch.complete_frame(1, Ok(())));

        let (responder, completion, slots) = batch.finish();
        assert!(responder.is_some());
        assert_eq!(completion.status, Err(DriverError::Cancelled));
        assert_eq!(completion.transferred, 32);
        assert_eq!(slots.as_slice(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_settle_unsent() {
        let batch = BatchRequest::new();
        let (tx, _rx) = oneshot::channel();
        batch.arm(tx, smallvec![5, 6, 7]);
        assert!(!batch.settle_unsent(0));
        assert!(!batch.complete_frame(0, Ok(())));
        assert!(batch.settle_unsent(2));
        assert_eq!(batch.pending(), 0);
    }

    #[test]
    fn test_rearm_clears_statuses() {
        let batch = BatchRequest::new();
        let (tx, _rx) = oneshot::channel();
        batch.arm(tx, smallvec![0, 1]);
        batch.complete_frame(0, Err(DriverError::Cancelled));
        batch.complete_frame(1, Ok(()));
        let _ = batch.finish();

        let (tx, _rx) = oneshot::channel();
        batch.arm(tx, smallvec![0, 1]);
        batch.complete_frame(0, Ok(()));
        batch.complete_frame(1, Ok(()));
        let (_, completion, _) = batch.finish();
        assert_eq!(completion.status, Ok(()));
        assert_eq!(completion.transferred, 32);
    }

    #[test]
    fn test_free_list_recycles() {
        let list = BatchFreeList::new();
        let batch = list.pop();
        list.push(batch);
        let _again = list.pop();
        assert_eq!(list.allocated(), 1);
        assert_eq!(list.idle(), 0);
    }
}
