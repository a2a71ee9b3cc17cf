use std::sync::Arc;

use tokio::sync::oneshot;

use crate::protocol::{
    CanFrame, Codec, UsbMessage, CAN_FRAME_RECORD_SIZE, MCBA_MESSAGE_SIZE, MCBA_VER_REQ_CAN,
    MCBA_VER_REQ_USB,
};

use super::{
    batch::{BatchFreeList, BatchRequest, MAX_BATCH_FRAMES},
    slot::{SlotIndex, SlotOwner, SlotPool},
    Completion, DriverError, Result, SubmitError, UsbTransport,
};

enum CompletionTarget {
    Standalone {
        responder: oneshot::Sender<Completion>,
        transferred: usize,
    },
    Batch {
        batch: Arc<BatchRequest>,
        position: usize,
    },
    Firmware {
        pic: u8,
    },
}

/// Ticket for one submitted transfer.
pub struct WriteCompletion {
    writer: Arc<Writer>,
    slot: SlotIndex,
    target: Option<CompletionTarget>,
}

impl WriteCompletion {
    fn new(writer: Arc<Writer>, slot: SlotIndex, target: CompletionTarget) -> Self {
        Self {
            writer,
            slot,
            target: Some(target),
        }
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Report the transfer result: bytes written, or the failure.
    pub fn complete(mut self, result: Result<usize>) {
        if let Some(target) = self.target.take() {
            self.writer.on_transfer_complete(self.slot, target, result);
        }
    }

    fn disarm(mut self) {
        self.target = None;
    }
}

impl Drop for WriteCompletion {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            log::warn!("transfer on slot {} dropped before completing", self.slot);
            self.writer
                .on_transfer_complete(self.slot, target, Err(DriverError::Cancelled));
        }
    }
}

impl std::fmt::Debug for WriteCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCompletion")
            .field("slot", &self.slot)
            .field("armed", &self.target.is_some())
            .finish()
    }
}

/// Write side of the device: turns frames and control messages into slot
/// transfers.
pub(crate) struct Writer {
    transport: Arc<dyn UsbTransport>,
    pool: SlotPool,
    batches: BatchFreeList,
    codec: Codec,
}

impl Writer {
    pub(crate) fn new(
        transport: Arc<dyn UsbTransport>,
        slot_count: usize,
        codec: Codec,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            pool: SlotPool::new(slot_count)?,
            batches: BatchFreeList::new(),
            codec,
        })
    }

    pub(crate) fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub(crate) fn codec(&self) -> &Codec {
        &self.codec
    }

    pub(crate) fn transport(&self) -> &Arc<dyn UsbTransport> {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn batches(&self) -> &BatchFreeList {
        &self.batches
    }

    /// Transmit up to [`MAX_BATCH_FRAMES`] frames as one request.
    pub(crate) async fn write_frames(self: &Arc<Self>, frames: &[CanFrame]) -> Completion {
        match frames {
            [] => Completion::done(0),
            [frame] => {
                let message = self.codec.encode_can_frame(frame);
                self.write_standalone(message, CAN_FRAME_RECORD_SIZE).await
            }
            _ if frames.len() <= MAX_BATCH_FRAMES => self.write_batch(frames).await,
            _ => {
                log::error!(
                    "batch write size {} exceeds max batch write size {}",
                    frames.len(),
                    MAX_BATCH_FRAMES
                );
                Completion::failed(DriverError::InvalidArgument(format!(
                    "{} frames in one write, at most {}",
                    frames.len(),
                    MAX_BATCH_FRAMES
                )))
            }
        }
    }

    /// Send one control message on its own slot.
    pub(crate) async fn write_control(self: &Arc<Self>, message: UsbMessage) -> Result<()> {
        self.write_standalone(message, 0).await.status
    }

    async fn write_standalone(self: &Arc<Self>, message: UsbMessage, transferred: usize) -> Completion {
        let slots = match self.pool.acquire(1).await {
            Ok(slots) => slots,
            Err(e) => return Completion::failed(e),
        };
        let slot = slots[0];
        self.pool.arm(slot, SlotOwner::Standalone, message);

        let (tx, rx) = oneshot::channel();
        let completion = WriteCompletion::new(
            Arc::clone(self),
            slot,
            CompletionTarget::Standalone {
                responder: tx,
                transferred,
            },
        );
        if let Err(SubmitError { error, completion }) =
            self.transport.submit_write(message, completion).await
        {
            log::error!("submit on slot {} failed: {}", slot, error);
            completion.disarm();
            self.pool.reuse(&slots);
            self.pool.release(&slots);
            return Completion::failed(error);
        }

        rx.await
            .unwrap_or_else(|_| Completion::failed(DriverError::DeviceStopped))
    }

    async fn write_batch(self: &Arc<Self>, frames: &[CanFrame]) -> Completion {
        let count = frames.len();
        let slots = match self.pool.acquire(count).await {
            Ok(slots) => slots,
            Err(e) => return Completion::failed(e),
        };

        let (tx, rx) = oneshot::channel();
        let batch = self.batches.pop();
        batch.arm(tx, slots.clone());
        log::debug!("batch of {} frames on slots {:?}", count, slots.as_slice());

        let mut unsent = UnsentFrames {
            writer: self,
            batch,
            count,
            handed_off: 0,
        };
        for (position, (frame, &slot)) in frames.iter().zip(slots.iter()).enumerate() {
            let message = self.codec.encode_can_frame(frame);
            self.pool.arm(
                slot,
                SlotOwner::Batch {
                    position: position as u8,
                },
                message,
            );
            let completion = WriteCompletion::new(
                Arc::clone(self),
                slot,
                CompletionTarget::Batch {
                    batch: Arc::clone(&unsent.batch),
                    position,
                },
            );
            // From here the completion settles this frame, even if this
            // future is dropped while the submission is pending.
            unsent.handed_off += 1;
            if let Err(SubmitError { error, completion }) =
                self.transport.submit_write(message, completion).await
            {
                log::error!("submit of frame {} of {} failed: {}", position, count, error);
                completion.disarm();
                unsent.handed_off -= 1;
                unsent.batch.record_unsent(position, Err(error));
                break;
            }
        }
        drop(unsent);

        rx.await
            .unwrap_or_else(|_| Completion::failed(DriverError::DeviceStopped))
    }

    /// Ask both firmware halves for their version, each request on its own
    /// slot. Replies arrive as keep-alive messages.
    pub(crate) async fn send_firmware_requests(self: &Arc<Self>) -> Result<()> {
        for pic in [MCBA_VER_REQ_USB, MCBA_VER_REQ_CAN] {
            self.send_firmware_request(pic).await?;
        }
        Ok(())
    }

    async fn send_firmware_request(self: &Arc<Self>, pic: u8) -> Result<()> {
        let slots = self.pool.acquire(1).await?;
        let slot = slots[0];
        let message = self.codec.encode_fw_version_request(pic);
        self.pool.arm(slot, SlotOwner::Firmware, message);
        let completion =
            WriteCompletion::new(Arc::clone(self), slot, CompletionTarget::Firmware { pic });
        if let Err(SubmitError { error, completion }) =
            self.transport.submit_write(message, completion).await
        {
            log::error!("firmware version request to pic {} failed: {}", pic, error);
            completion.disarm();
            self.pool.reuse(&slots);
            self.pool.release(&slots);
            return Err(error);
        }
        Ok(())
    }

    fn on_transfer_complete(&self, slot: SlotIndex, target: CompletionTarget, result: Result<usize>) {
        match target {
            CompletionTarget::Standalone {
                responder,
                transferred,
            } => {
                let completion = match result {
                    Ok(written) => {
                        log::trace!("slot {} wrote {} bytes", slot, written);
                        Completion::done(transferred)
                    }
                    Err(e) => {
                        log::error!("write on slot {} failed: {}", slot, e);
                        Completion::failed(e)
                    }
                };
                self.pool.reuse(&[slot]);
                self.pool.release(&[slot]);
                let _ = responder.send(completion);
            }
            CompletionTarget::Batch { batch, position } => {
                let status = match result {
                    Ok(MCBA_MESSAGE_SIZE) => Ok(()),
                    Ok(written) => {
                        log::warn!(
                            "incomplete write of {} bytes on slot {}, expected {}",
                            written,
                            slot,
                            MCBA_MESSAGE_SIZE
                        );
                        Err(DriverError::IncompleteWrite {
                            written,
                            expected: MCBA_MESSAGE_SIZE,
                        })
                    }
                    Err(e) => {
                        log::error!("write of batch frame {} failed: {}", position, e);
                        Err(e)
                    }
                };
                if batch.complete_frame(position, status) {
                    self.finalize_batch(&batch);
                }
            }
            CompletionTarget::Firmware { pic } => {
                if let Err(e) = result {
                    log::error!("firmware version request to pic {} failed: {}", pic, e);
                }
                self.pool.reuse(&[slot]);
                self.pool.release(&[slot]);
            }
        }
    }

    fn finalize_batch(&self, batch: &Arc<BatchRequest>) {
        let (responder, completion, slots) = batch.finish();
        log::debug!(
            "batch on slots {:?} finished with {:?}, {} bytes",
            slots.as_slice(),
            completion.status,
            completion.transferred
        );
        self.pool.reuse(&slots);
        self.pool.release(&slots);
        self.batches.push(Arc::clone(batch));
        if let Some(responder) = responder {
            let _ = responder.send(completion);
        }
    }
}

/// Settles the frames of a batch that no transfer will ever complete:
/// those after a failed submission, or all remaining ones when the write
/// is dropped mid-way.
struct UnsentFrames<'a> {
    writer: &'a Writer,
    batch: Arc<BatchRequest>,
    count: usize,
    handed_off: usize,
}

impl Drop for UnsentFrames<'_> {
    fn drop(&mut self) {
        let unsent = self.count - self.handed_off;
        if unsent != 0 {
            log::debug!("{} of {} batch frames never submitted", unsent, self.count);
        }
        if self.batch.settle_unsent(unsent) {
            self.writer.finalize_batch(&self.batch);
        }
    }
}
