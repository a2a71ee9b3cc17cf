mod endian;
mod frame;
mod mcba;
mod status;

pub use endian::{ByteOrder, Endian};
pub use frame::{
    record_count, CanFrame, CanIdFlags, ReceivedFrame, CAN_EFF_MASK, CAN_FRAME_RECORD_SIZE,
    CAN_MAX_DLC, CAN_MAX_DLEN, CAN_SFF_MASK, RECEIVED_FRAME_RECORD_SIZE,
};
pub use mcba::{
    Codec, CommandId, KeepAliveCan, KeepAliveUsb, Sid, UsbMessage, MCBA_MESSAGE_SIZE,
    MCBA_VER_REQ_CAN, MCBA_VER_REQ_USB,
};
pub use status::{
    bitrate_from_raw, Bitrate, CanBusState, DeviceStats, DeviceStatus, FirmwareVersion,
    MCBA_CAN_STATE_ERR_PSV_TH, MCBA_CAN_STATE_WRN_TH, MCBA_TERMINATION_DISABLED,
    MCBA_TERMINATION_ENABLED,
};
