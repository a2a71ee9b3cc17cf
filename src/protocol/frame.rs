use bitflags::bitflags;
use embedded_can::{ExtendedId, Frame as EmbeddedFrame, Id, StandardId};

use crate::adaptor::{DriverError, Result};

pub const CAN_MAX_DLC: u8 = 8;
pub const CAN_MAX_DLEN: usize = 8;
pub const CAN_SFF_MASK: u32 = 0x0000_07ff;
pub const CAN_EFF_MASK: u32 = 0x1fff_ffff;

/// Size of one [`CanFrame`] in a host write buffer.
pub const CAN_FRAME_RECORD_SIZE: usize = 16;
/// Size of one [`ReceivedFrame`] in a host read buffer.
pub const RECEIVED_FRAME_RECORD_SIZE: usize = CAN_FRAME_RECORD_SIZE + 8;

bitflags! {
    /// Flag bits carried above the 29 bit identifier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CanIdFlags: u32 {
        const EXTENDED = 0x8000_0000;
        const REMOTE = 0x4000_0000;
        const ERROR = 0x2000_0000;
    }
}

/// A classic CAN frame as exchanged with host applications.
///
/// The identifier word holds the 11 or 29 bit id in its low bits and
/// [`CanIdFlags`] in the top three bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl CanFrame {
    /// Build a frame from its raw parts. The dlc is clamped to 8.
    pub fn from_raw(id: u32, dlc: u8, data: [u8; CAN_MAX_DLEN]) -> Self {
        Self {
            id,
            dlc: dlc.min(CAN_MAX_DLC),
            data,
        }
    }

    pub fn new_standard(id: u16, data: &[u8]) -> Option<Self> {
        EmbeddedFrame::new(StandardId::new(id)?, data)
    }

    pub fn new_extended(id: u32, data: &[u8]) -> Option<Self> {
        EmbeddedFrame::new(ExtendedId::new(id)?, data)
    }

    /// Identifier word including flag bits.
    pub fn raw_id(&self) -> u32 {
        self.id
    }

    /// Identifier without flag bits.
    pub fn can_id(&self) -> u32 {
        if self.flags().contains(CanIdFlags::EXTENDED) {
            self.id & CAN_EFF_MASK
        } else {
            self.id & CAN_SFF_MASK
        }
    }

    pub fn flags(&self) -> CanIdFlags {
        CanIdFlags::from_bits_truncate(self.id)
    }

    pub fn dlc_u8(&self) -> u8 {
        self.dlc
    }

    /// All eight payload bytes, including the ones past the dlc.
    pub fn data_bytes(&self) -> &[u8; CAN_MAX_DLEN] {
        &self.data
    }

    pub fn to_record(&self) -> [u8; CAN_FRAME_RECORD_SIZE] {
        let mut record = [0u8; CAN_FRAME_RECORD_SIZE];
        record[0..4].copy_from_slice(&self.id.to_ne_bytes());
        record[4] = self.dlc;
        record[8..16].copy_from_slice(&self.data);
        record
    }

    pub fn from_record(record: &[u8; CAN_FRAME_RECORD_SIZE]) -> Self {
        let mut id = [0u8; 4];
        id.copy_from_slice(&record[0..4]);
        let mut data = [0u8; CAN_MAX_DLEN];
        data.copy_from_slice(&record[8..16]);
        Self::from_raw(u32::from_ne_bytes(id), record[4], data)
    }

    /// Split a host write buffer into frames.
    pub fn from_records(buf: &[u8]) -> Result<Vec<Self>> {
        let count = record_count(buf.len(), CAN_FRAME_RECORD_SIZE)?;
        let mut frames = Vec::with_capacity(count);
        for chunk in buf.chunks_exact(CAN_FRAME_RECORD_SIZE) {
            let mut record = [0u8; CAN_FRAME_RECORD_SIZE];
            record.copy_from_slice(chunk);
            frames.push(Self::from_record(&record));
        }
        Ok(frames)
    }
}

impl EmbeddedFrame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > CAN_MAX_DLEN {
            return None;
        }
        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: raw_from_id(id.into()),
            dlc: data.len() as u8,
            data: buf,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > CAN_MAX_DLEN {
            return None;
        }
        Some(Self {
            id: raw_from_id(id.into()) | CanIdFlags::REMOTE.bits(),
            dlc: dlc as u8,
            data: [0u8; CAN_MAX_DLEN],
        })
    }

    fn is_extended(&self) -> bool {
        self.flags().contains(CanIdFlags::EXTENDED)
    }

    fn is_remote_frame(&self) -> bool {
        self.flags().contains(CanIdFlags::REMOTE)
    }

    fn id(&self) -> Id {
        // Masked ids are always in range.
        if self.is_extended() {
            Id::Extended(ExtendedId::new(self.id & CAN_EFF_MASK).unwrap_or(ExtendedId::ZERO))
        } else {
            Id::Standard(StandardId::new((self.id & CAN_SFF_MASK) as u16).unwrap_or(StandardId::ZERO))
        }
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        if self.is_remote_frame() {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }
}

fn raw_from_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw() | CanIdFlags::EXTENDED.bits(),
    }
}

/// A frame delivered to a client, stamped with its arrival time in
/// microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceivedFrame {
    pub frame: CanFrame,
    pub timestamp: u64,
}

impl ReceivedFrame {
    pub fn new(frame: CanFrame, timestamp: u64) -> Self {
        Self { frame, timestamp }
    }

    pub fn to_record(&self) -> [u8; RECEIVED_FRAME_RECORD_SIZE] {
        let mut record = [0u8; RECEIVED_FRAME_RECORD_SIZE];
        record[..CAN_FRAME_RECORD_SIZE].copy_from_slice(&self.frame.to_record());
        record[CAN_FRAME_RECORD_SIZE..].copy_from_slice(&self.timestamp.to_ne_bytes());
        record
    }

    /// Serialize frames into a host read buffer.
    pub fn write_records(frames: &[Self], out: &mut [u8]) -> Result<usize> {
        let needed = frames.len() * RECEIVED_FRAME_RECORD_SIZE;
        if out.len() < needed {
            return Err(DriverError::InvalidArgument(format!(
                "read buffer of {} bytes cannot hold {} records",
                out.len(),
                frames.len()
            )));
        }
        for (frame, chunk) in frames
            .iter()
            .zip(out.chunks_exact_mut(RECEIVED_FRAME_RECORD_SIZE))
        {
            chunk.copy_from_slice(&frame.to_record());
        }
        Ok(needed)
    }
}

/// Number of whole records in a host buffer of `len` bytes.
pub fn record_count(len: usize, record_size: usize) -> Result<usize> {
    let count = len / record_size;
    if count * record_size != len {
        log::error!(
            "buffer length={} is not a multiple of record size {}",
            len,
            record_size
        );
        return Err(DriverError::InvalidArgument(format!(
            "length {} is not a multiple of {}",
            len, record_size
        )));
    }
    Ok(count)
}
