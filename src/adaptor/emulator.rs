//! Software stand-in for the adapter firmware, driven over a [`Channel`].

use std::time::Duration;

use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use super::{
    channel::{Channel, OutboundTransfer},
    Result,
};
use crate::protocol::{
    Codec, CommandId, FirmwareVersion, KeepAliveCan, KeepAliveUsb, UsbMessage, MCBA_MESSAGE_SIZE,
    MCBA_TERMINATION_DISABLED, MCBA_TERMINATION_ENABLED, MCBA_VER_REQ_CAN, MCBA_VER_REQ_USB,
};

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Unsolicited keep-alives from both halves. `None` disables them.
    pub keep_alive_period: Option<Duration>,
    /// Echo transmitted frames back as received frames.
    pub loopback: bool,
    pub usb_version: FirmwareVersion,
    pub can_version: FirmwareVersion,
    /// Reported in CAN keep-alives until the host changes it.
    pub bitrate_kbps: u16,
    pub termination: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            keep_alive_period: None,
            loopback: true,
            usb_version: FirmwareVersion { major: 2, minor: 6 },
            can_version: FirmwareVersion { major: 3, minor: 1 },
            bitrate_kbps: 500,
            termination: true,
        }
    }
}

/// Build a connected [`Channel`] and [`Emulator`]. `capacity` bounds both
/// directions.
pub fn channel_pair(capacity: usize, config: EmulatorConfig) -> Result<(Channel, Emulator)> {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let emulator = Emulator::new(out_rx, in_tx, Codec::detect()?, config);
    Ok((Channel::new(out_tx, in_rx), emulator))
}

pub struct Emulator {
    inbound: Receiver<OutboundTransfer>,
    to_host: Sender<Vec<u8>>,
    codec: Codec,
    config: EmulatorConfig,
    bitrate_kbps: u16,
    termination_state: u8,
}

impl Emulator {
    fn new(
        inbound: Receiver<OutboundTransfer>,
        to_host: Sender<Vec<u8>>,
        codec: Codec,
        config: EmulatorConfig,
    ) -> Self {
        Self {
            inbound,
            to_host,
            codec,
            bitrate_kbps: config.bitrate_kbps,
            termination_state: if config.termination {
                MCBA_TERMINATION_ENABLED
            } else {
                MCBA_TERMINATION_DISABLED
            },
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve transfers until the host side of the channel is dropped.
    pub async fn run(mut self) {
        let period = self.config.keep_alive_period;
        let mut ticker = tokio::time::interval(period.unwrap_or(Duration::from_secs(3600)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                transfer = self.inbound.recv() => match transfer {
                    Some(transfer) => self.handle(transfer).await,
                    None => break,
                },
                _ = ticker.tick(), if period.is_some() => {
                    let mut payload = self.keep_alive_usb().as_bytes().to_vec();
                    payload.extend_from_slice(self.keep_alive_can().as_bytes());
                    self.send(payload).await;
                }
            }
        }
        log::debug!("emulator stopped");
    }

    async fn handle(&mut self, transfer: OutboundTransfer) {
        let OutboundTransfer {
            message,
            completion,
        } = transfer;
        let bytes = message.as_bytes();

        let reply = match message.command_id() {
            Some(CommandId::TransmitMessageEv) => self.config.loopback.then(|| {
                let mut echo = *bytes;
                echo[0] = CommandId::ReceiveMessage.into();
                UsbMessage::from_bytes(echo)
            }),
            Some(CommandId::ChangeBitRate) => {
                self.bitrate_kbps = self.codec.change_bitrate_kbps(&message);
                log::debug!("emulator bitrate {} kbps", self.bitrate_kbps);
                Some(self.keep_alive_can())
            }
            Some(CommandId::SetupTerminationResistance) => {
                self.termination_state = if bytes[1] != 0 {
                    MCBA_TERMINATION_ENABLED
                } else {
                    MCBA_TERMINATION_DISABLED
                };
                Some(self.keep_alive_usb())
            }
            Some(CommandId::ReadFwVersion) => match bytes[1] {
                MCBA_VER_REQ_USB => Some(self.keep_alive_usb()),
                MCBA_VER_REQ_CAN => Some(self.keep_alive_can()),
                pic => {
                    log::warn!("firmware version request for unknown pic {}", pic);
                    None
                }
            },
            _ => {
                log::warn!("emulator ignoring command 0x{:02x}", message.command());
                None
            }
        };

        if let Some(reply) = reply {
            self.send(reply.as_bytes().to_vec()).await;
        }
        completion.complete(Ok(MCBA_MESSAGE_SIZE));
    }

    async fn send(&self, payload: Vec<u8>) {
        if self.to_host.send(payload).await.is_err() {
            log::debug!("host reader gone, dropping reply");
        }
    }

    fn keep_alive_can(&self) -> UsbMessage {
        self.codec.encode_keep_alive_can(&KeepAliveCan {
            can_bitrate: self.bitrate_kbps,
            soft_ver_major: self.config.can_version.major,
            soft_ver_minor: self.config.can_version.minor,
            ..Default::default()
        })
    }

    fn keep_alive_usb(&self) -> UsbMessage {
        self.codec.encode_keep_alive_usb(&KeepAliveUsb {
            termination_state: self.termination_state,
            soft_ver_major: self.config.usb_version.major,
            soft_ver_minor: self.config.usb_version.minor,
        })
    }
}
