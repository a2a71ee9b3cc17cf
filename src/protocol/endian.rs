//! Host byte order selection.
//!
//! The adapter mixes big endian and little endian 16 bit fields. The
//! conversion routines are picked once when the device starts instead of
//! relying on `cfg(target_endian)`.

use crate::adaptor::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Probe the byte order of the running host.
    pub fn detect() -> Result<Self> {
        match 0x0102u16.to_ne_bytes() {
            [0x02, 0x01] => Ok(ByteOrder::Little),
            [0x01, 0x02] => Ok(ByteOrder::Big),
            _ => Err(DriverError::UnsupportedPlatform),
        }
    }
}

fn swap16(value: u16) -> u16 {
    value.swap_bytes()
}

fn nop16(value: u16) -> u16 {
    value
}

/// Conversions between wire words and host words.
///
/// Both conversions are involutions, so the same function maps host to
/// wire order and back.
#[derive(Clone, Copy)]
pub struct Endian {
    order: ByteOrder,
    big_endian_to_host: fn(u16) -> u16,
    little_endian_to_host: fn(u16) -> u16,
}

impl Endian {
    pub fn detect() -> Result<Self> {
        let order = ByteOrder::detect()?;
        log::debug!("host byte order {:?}", order);
        Ok(Self::for_order(order))
    }

    pub(crate) fn for_order(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Little => Self {
                order,
                big_endian_to_host: swap16,
                little_endian_to_host: nop16,
            },
            ByteOrder::Big => Self {
                order,
                big_endian_to_host: nop16,
                little_endian_to_host: swap16,
            },
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Interpret two wire bytes holding a big endian word.
    pub fn read_be16(&self, raw: [u8; 2]) -> u16 {
        (self.big_endian_to_host)(u16::from_ne_bytes(raw))
    }

    /// Interpret two wire bytes holding a little endian word.
    pub fn read_le16(&self, raw: [u8; 2]) -> u16 {
        (self.little_endian_to_host)(u16::from_ne_bytes(raw))
    }

    pub fn write_be16(&self, value: u16) -> [u8; 2] {
        (self.big_endian_to_host)(value).to_ne_bytes()
    }

    pub fn write_le16(&self, value: u16) -> [u8; 2] {
        (self.little_endian_to_host)(value).to_ne_bytes()
    }
}

impl std::fmt::Debug for Endian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endian").field("order", &self.order).finish()
    }
}
