//! Wire format of the MCBA adapter.
//!
//! Every USB bulk transfer carries whole 19 byte messages. The first byte
//! is the command id; the remaining layout depends on it.

use bitfield::bitfield;
use nom::{
    bytes::complete::take,
    combinator::map_res,
    number::complete::u8 as byte,
    sequence::tuple,
    IResult,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::adaptor::{DriverError, Result};

use super::{
    endian::Endian,
    frame::{CanFrame, CanIdFlags, CAN_MAX_DLC, CAN_MAX_DLEN, CAN_SFF_MASK},
    status::{bitrate_from_raw, CanBusState, DeviceStatus, FirmwareVersion},
};

pub const MCBA_MESSAGE_SIZE: usize = 19;

pub const MCBA_VER_REQ_USB: u8 = 1;
pub const MCBA_VER_REQ_CAN: u8 = 2;

const MCBA_DLC_MASK: u8 = 0xf;
const MCBA_DLC_RTR_MASK: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandId {
    /// Left over when the adapter stacks messages at power up.
    Stacked = 0x00,
    ChangeBitRate = 0xA1,
    TransmitMessageEv = 0xA3,
    SetupTerminationResistance = 0xA8,
    ReadFwVersion = 0xA9,
    TransmitMessageRsp = 0xE2,
    ReceiveMessage = 0xE3,
    IAmAliveFromCan = 0xF5,
    IAmAliveFromUsb = 0xF7,
    NothingToSend = 0xFF,
}

bitfield! {
    /// SID word of a CAN message, host order.
    ///
    /// Extended frames keep id bits 28..18 in `high_id` and bits 17..16 in
    /// `eid_high`; standard frames keep the whole 11 bit id in `high_id`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Sid(u16);
    impl Debug;
    u16;
    pub high_id, set_high_id: 15, 5;
    pub extended, set_extended: 3;
    pub eid_high, set_eid_high: 1, 0;
}

/// One fixed size adapter message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsbMessage([u8; MCBA_MESSAGE_SIZE]);

impl UsbMessage {
    pub fn new(command: CommandId) -> Self {
        let mut bytes = [0u8; MCBA_MESSAGE_SIZE];
        bytes[0] = command.into();
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; MCBA_MESSAGE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy a message out of a slice of exactly [`MCBA_MESSAGE_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; MCBA_MESSAGE_SIZE]>::try_from(bytes).ok().map(Self)
    }

    pub fn command(&self) -> u8 {
        self.0[0]
    }

    pub fn command_id(&self) -> Option<CommandId> {
        CommandId::try_from(self.0[0]).ok()
    }

    pub fn as_bytes(&self) -> &[u8; MCBA_MESSAGE_SIZE] {
        &self.0
    }

    fn body_mut(&mut self) -> &mut [u8] {
        &mut self.0[1..]
    }
}

impl Default for UsbMessage {
    fn default() -> Self {
        Self([0u8; MCBA_MESSAGE_SIZE])
    }
}

impl std::fmt::Debug for UsbMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UsbMessage({:02x?})", &self.0)
    }
}

/// Telemetry from the CAN side firmware, in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepAliveCan {
    pub tx_err_cnt: u8,
    pub rx_err_cnt: u8,
    pub rx_buff_ovfl: u8,
    pub tx_bus_off: u8,
    /// kbps, truncated for 33.333 and 83.333.
    pub can_bitrate: u16,
    pub rx_lost: u16,
    pub can_stat: u8,
    pub soft_ver_major: u8,
    pub soft_ver_minor: u8,
    pub debug_mode: u8,
    pub test_complete: u8,
    pub test_result: u8,
}

/// Telemetry from the USB side firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepAliveUsb {
    pub termination_state: u8,
    pub soft_ver_major: u8,
    pub soft_ver_minor: u8,
}

fn word(input: &[u8]) -> IResult<&[u8], [u8; 2]> {
    map_res(take(2usize), <[u8; 2]>::try_from)(input)
}

/// Stateless conversions between frames, telemetry and wire messages.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    endian: Endian,
}

impl Codec {
    pub fn new(endian: Endian) -> Self {
        Self { endian }
    }

    /// Probe the host byte order. Fails with
    /// [`DriverError::UnsupportedPlatform`] on a mixed endian host.
    pub fn detect() -> Result<Self> {
        Ok(Self::new(Endian::detect()?))
    }

    pub fn encode_can_frame(&self, frame: &CanFrame) -> UsbMessage {
        let mut msg = UsbMessage::new(CommandId::TransmitMessageEv);
        let id = frame.raw_id();
        let flags = frame.flags();

        let mut sid = Sid(0);
        let eid = if flags.contains(CanIdFlags::EXTENDED) {
            sid.set_extended(true);
            sid.set_high_id(((id & 0x1ffc_0000) >> 18) as u16);
            sid.set_eid_high(((id & 0x0003_0000) >> 16) as u16);
            (id & 0xffff) as u16
        } else {
            sid.set_high_id((id & CAN_SFF_MASK) as u16);
            0
        };

        let mut dlc = frame.dlc_u8().min(CAN_MAX_DLC);
        if flags.contains(CanIdFlags::REMOTE) {
            dlc |= MCBA_DLC_RTR_MASK;
        }

        let body = msg.body_mut();
        body[0..2].copy_from_slice(&self.endian.write_be16(eid));
        body[2..4].copy_from_slice(&self.endian.write_be16(sid.0));
        body[4] = dlc;
        body[5..13].copy_from_slice(frame.data_bytes());
        msg
    }

    /// Inverse of [`Codec::encode_can_frame`]. A dlc above 8 is clamped.
    pub fn decode_can_frame(&self, msg: &UsbMessage) -> CanFrame {
        let bytes = msg.as_bytes();
        let eid = self.endian.read_be16([bytes[1], bytes[2]]);
        let sid = Sid(self.endian.read_be16([bytes[3], bytes[4]]));

        let mut id = if sid.extended() {
            CanIdFlags::EXTENDED.bits()
                | u32::from(sid.high_id()) << 18
                | u32::from(sid.eid_high()) << 16
                | u32::from(eid)
        } else {
            u32::from(sid.high_id())
        };
        if bytes[5] & MCBA_DLC_RTR_MASK != 0 {
            id |= CanIdFlags::REMOTE.bits();
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        data.copy_from_slice(&bytes[6..14]);
        CanFrame::from_raw(id, bytes[5] & MCBA_DLC_MASK, data)
    }

    pub fn parse_keep_alive_can<'a>(&self, input: &'a [u8]) -> IResult<&'a [u8], KeepAliveCan> {
        let (input, (_cmd, tx_err_cnt, rx_err_cnt, rx_buff_ovfl, tx_bus_off)) =
            tuple((byte, byte, byte, byte, byte))(input)?;
        let (input, (can_bitrate, rx_lost)) = tuple((word, word))(input)?;
        let (input, (can_stat, soft_ver_major, soft_ver_minor, debug_mode, test_complete, test_result)) =
            tuple((byte, byte, byte, byte, byte, byte))(input)?;
        Ok((
            input,
            KeepAliveCan {
                tx_err_cnt,
                rx_err_cnt,
                rx_buff_ovfl,
                tx_bus_off,
                can_bitrate: self.endian.read_be16(can_bitrate),
                rx_lost: self.endian.read_le16(rx_lost),
                can_stat,
                soft_ver_major,
                soft_ver_minor,
                debug_mode,
                test_complete,
                test_result,
            },
        ))
    }

    pub fn parse_keep_alive_usb<'a>(&self, input: &'a [u8]) -> IResult<&'a [u8], KeepAliveUsb> {
        let (input, (_cmd, termination_state, soft_ver_major, soft_ver_minor)) =
            tuple((byte, byte, byte, byte))(input)?;
        Ok((
            input,
            KeepAliveUsb {
                termination_state,
                soft_ver_major,
                soft_ver_minor,
            },
        ))
    }

    /// Fold a CAN keep-alive into `status`. Counters accumulate.
    pub fn decode_keep_alive_can(&self, msg: &UsbMessage, status: &mut DeviceStatus) -> Result<()> {
        let (_, ka) = self
            .parse_keep_alive_can(msg.as_bytes())
            .map_err(|e| DriverError::ProtocolViolation(format!("keep-alive from CAN: {}", e)))?;

        status.bitrate = bitrate_from_raw(ka.can_bitrate);
        let stats = &mut status.stats;
        stats.rx_lost = stats.rx_lost.wrapping_add(u64::from(ka.rx_lost));
        stats.rx_buffer_overflow = stats.rx_buffer_overflow.wrapping_add(u64::from(ka.rx_buff_ovfl));
        stats.tx_error_count = stats.tx_error_count.wrapping_add(u64::from(ka.tx_err_cnt));
        stats.rx_error_count = stats.rx_error_count.wrapping_add(u64::from(ka.rx_err_cnt));
        stats.tx_bus_off = stats.tx_bus_off.wrapping_add(u64::from(ka.tx_bus_off));
        status.can_version = FirmwareVersion {
            major: ka.soft_ver_major,
            minor: ka.soft_ver_minor,
        };
        status.bus_state = CanBusState::from_counters(ka.tx_err_cnt, ka.rx_err_cnt, ka.tx_bus_off != 0);
        Ok(())
    }

    pub fn decode_keep_alive_usb(&self, msg: &UsbMessage, status: &mut DeviceStatus) -> Result<()> {
        let (_, ka) = self
            .parse_keep_alive_usb(msg.as_bytes())
            .map_err(|e| DriverError::ProtocolViolation(format!("keep-alive from USB: {}", e)))?;
        status.usb_version = FirmwareVersion {
            major: ka.soft_ver_major,
            minor: ka.soft_ver_minor,
        };
        status.termination_state = ka.termination_state;
        Ok(())
    }

    pub fn encode_keep_alive_can(&self, ka: &KeepAliveCan) -> UsbMessage {
        let mut msg = UsbMessage::new(CommandId::IAmAliveFromCan);
        let body = msg.body_mut();
        body[0] = ka.tx_err_cnt;
        body[1] = ka.rx_err_cnt;
        body[2] = ka.rx_buff_ovfl;
        body[3] = ka.tx_bus_off;
        body[4..6].copy_from_slice(&self.endian.write_be16(ka.can_bitrate));
        body[6..8].copy_from_slice(&self.endian.write_le16(ka.rx_lost));
        body[8] = ka.can_stat;
        body[9] = ka.soft_ver_major;
        body[10] = ka.soft_ver_minor;
        body[11] = ka.debug_mode;
        body[12] = ka.test_complete;
        body[13] = ka.test_result;
        msg
    }

    pub fn encode_keep_alive_usb(&self, ka: &KeepAliveUsb) -> UsbMessage {
        let mut msg = UsbMessage::new(CommandId::IAmAliveFromUsb);
        let body = msg.body_mut();
        body[0] = ka.termination_state;
        body[1] = ka.soft_ver_major;
        body[2] = ka.soft_ver_minor;
        msg
    }

    /// Bitrate change request. The adapter takes kbps.
    pub fn encode_change_bitrate(&self, bps: u32) -> Result<UsbMessage> {
        let kbps = u16::try_from(bps / 1000)
            .map_err(|_| DriverError::InvalidArgument(format!("bitrate {} out of range", bps)))?;
        let mut msg = UsbMessage::new(CommandId::ChangeBitRate);
        msg.body_mut()[0..2].copy_from_slice(&self.endian.write_be16(kbps));
        Ok(msg)
    }

    pub fn change_bitrate_kbps(&self, msg: &UsbMessage) -> u16 {
        let bytes = msg.as_bytes();
        self.endian.read_be16([bytes[1], bytes[2]])
    }

    pub fn encode_termination(&self, enabled: bool) -> UsbMessage {
        let mut msg = UsbMessage::new(CommandId::SetupTerminationResistance);
        msg.body_mut()[0] = u8::from(enabled);
        msg
    }

    /// `pic` is [`MCBA_VER_REQ_USB`] or [`MCBA_VER_REQ_CAN`].
    pub fn encode_fw_version_request(&self, pic: u8) -> UsbMessage {
        let mut msg = UsbMessage::new(CommandId::ReadFwVersion);
        msg.body_mut()[0] = pic;
        msg
    }
}
