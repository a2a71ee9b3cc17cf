use std::sync::Weak;

use async_trait::async_trait;

use crate::{demux::ReceiveDemux, protocol::UsbMessage};

mod batch;
mod channel;
mod emulator;
mod error;
mod slot;
mod writer;

pub use channel::{Channel, OutboundTransfer};
pub use emulator::{channel_pair, Emulator, EmulatorConfig};
pub use error::{DriverError, Result};
pub use slot::{SlotIndex, SlotOwner, SlotPool, SlotSet, MAX_SLOTS};
pub use writer::WriteCompletion;

pub(crate) use batch::MAX_BATCH_FRAMES;
pub(crate) use writer::Writer;

/// Bulk pipes of the adapter.
///
/// `submit_write` either hands the completion back inside a
/// [`SubmitError`], in which case no transfer exists, or takes ownership
/// of it and calls [`WriteCompletion::complete`] exactly once. A
/// completion dropped without being called settles as
/// [`DriverError::Cancelled`].
#[async_trait]
pub trait UsbTransport: Send + Sync + 'static {
    async fn submit_write(
        &self,
        message: UsbMessage,
        completion: WriteCompletion,
    ) -> std::result::Result<(), SubmitError>;

    /// Start pulling bulk-in data and feed it to `sink` until the pipes
    /// stop.
    fn start_continuous_read(&self, sink: BulkInSink) -> Result<()>;

    async fn stop_pipes(&self);
}

/// A write that never reached the transport.
#[derive(Debug)]
pub struct SubmitError {
    pub error: DriverError,
    pub completion: WriteCompletion,
}

impl SubmitError {
    pub fn new(error: DriverError, completion: WriteCompletion) -> Self {
        Self { error, completion }
    }
}

/// Final outcome of a write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: Result<()>,
    /// Bytes of the caller's buffer accounted as written.
    pub transferred: usize,
}

impl Completion {
    pub fn done(transferred: usize) -> Self {
        Self {
            status: Ok(()),
            transferred,
        }
    }

    pub fn failed(error: DriverError) -> Self {
        Self {
            status: Err(error),
            transferred: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn into_result(self) -> Result<usize> {
        self.status.map(|()| self.transferred)
    }
}

/// Receiving end of the continuous bulk-in reader.
#[derive(Clone)]
pub struct BulkInSink {
    demux: Weak<ReceiveDemux>,
}

impl BulkInSink {
    pub(crate) fn new(demux: Weak<ReceiveDemux>) -> Self {
        Self { demux }
    }

    /// Hand freshly read bytes to the device. Returns false once the
    /// device is gone and the reader should stop.
    pub fn deliver(&self, bytes: &[u8]) -> bool {
        match self.demux.upgrade() {
            Some(demux) => {
                demux.process(bytes);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for BulkInSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkInSink")
            .field("attached", &(self.demux.strong_count() > 0))
            .finish()
    }
}
