use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    protocol::{Codec, CommandId, DeviceStatus, ReceivedFrame, UsbMessage, MCBA_MESSAGE_SIZE},
    session::{ClientList, ClientListGuard},
    utils::now_micros,
};

/// Splits bulk-in data into adapter messages and routes them.
///
/// CAN frames are copied to every registered client; keep-alives update
/// the shared device status.
pub struct ReceiveDemux {
    codec: Codec,
    status: Arc<Mutex<DeviceStatus>>,
    clients: Arc<ClientList>,
    unsupported: AtomicU64,
}

impl ReceiveDemux {
    pub(crate) fn new(codec: Codec, status: Arc<Mutex<DeviceStatus>>, clients: Arc<ClientList>) -> Self {
        Self {
            codec,
            status,
            clients,
            unsupported: AtomicU64::new(0),
        }
    }

    /// Messages skipped because of an unknown or unexpected command id.
    pub fn unsupported_messages(&self) -> u64 {
        self.unsupported.load(Ordering::Relaxed)
    }

    pub fn process(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            log::warn!("zero length read");
            return;
        }
        let count = bytes.len() / MCBA_MESSAGE_SIZE;
        if count * MCBA_MESSAGE_SIZE != bytes.len() {
            log::warn!(
                "payload length={} is not a multiple of {}, ignoring {} trailing bytes",
                bytes.len(),
                MCBA_MESSAGE_SIZE,
                bytes.len() - count * MCBA_MESSAGE_SIZE
            );
        }

        // Taken on the first CAN frame and held to the end of the batch.
        let mut clients: Option<ClientListGuard<'_>> = None;

        for (i, chunk) in bytes.chunks_exact(MCBA_MESSAGE_SIZE).enumerate() {
            let Some(msg) = UsbMessage::from_slice(chunk) else {
                continue;
            };
            match msg.command_id() {
                Some(CommandId::IAmAliveFromCan) => {
                    if let Err(e) = self.codec.decode_keep_alive_can(&msg, &mut self.status.lock()) {
                        log::warn!("{}", e);
                    }
                }
                Some(CommandId::IAmAliveFromUsb) => {
                    if let Err(e) = self.codec.decode_keep_alive_usb(&msg, &mut self.status.lock()) {
                        log::warn!("{}", e);
                    }
                }
                Some(CommandId::ReceiveMessage) => {
                    let clients = clients.get_or_insert_with(|| self.clients.lock());
                    if clients.is_empty() {
                        continue;
                    }
                    let frame = ReceivedFrame::new(self.codec.decode_can_frame(&msg), now_micros());
                    for (_, queue) in clients.iter() {
                        queue.push(frame);
                    }
                }
                // PIC_CAN telling PIC_USB it has nothing to send, and the
                // timestamped transmit response.
                Some(CommandId::NothingToSend) | Some(CommandId::TransmitMessageRsp) => {}
                Some(CommandId::Stacked) => {
                    log::trace!("message index {}, command id 0x00", i);
                }
                _ => {
                    self.unsupported.fetch_add(1, Ordering::Relaxed);
                    log::warn!("unsupported command id 0x{:02x}", msg.command());
                }
            }
        }
    }
}
