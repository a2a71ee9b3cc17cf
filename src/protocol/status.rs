use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Error counter level at which the controller enters the warning state.
pub const MCBA_CAN_STATE_WRN_TH: u8 = 95;
/// Error counter level at which the controller turns error passive.
pub const MCBA_CAN_STATE_ERR_PSV_TH: u8 = 127;

pub const MCBA_TERMINATION_DISABLED: u8 = 0;
pub const MCBA_TERMINATION_ENABLED: u8 = 120;

/// Bitrates accepted by the adapter firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Bitrate {
    Unknown = 0,
    Kbps20 = 20_000,
    Kbps33 = 33_333,
    Kbps50 = 50_000,
    Kbps80 = 80_000,
    Kbps83 = 83_333,
    Kbps100 = 100_000,
    Kbps125 = 125_000,
    Kbps150 = 150_000,
    Kbps175 = 175_000,
    Kbps200 = 200_000,
    Kbps225 = 225_000,
    Kbps250 = 250_000,
    Kbps275 = 275_000,
    Kbps300 = 300_000,
    Kbps500 = 500_000,
    Kbps625 = 625_000,
    Kbps800 = 800_000,
    Kbps1000 = 1_000_000,
}

impl Bitrate {
    pub fn bps(self) -> u32 {
        self.into()
    }
}

/// Map the kbps value reported in a CAN keep-alive to bits per second.
///
/// The firmware truncates 33.333 and 83.333 kbps to 33 and 83.
pub fn bitrate_from_raw(raw: u16) -> u32 {
    match raw {
        33 | 83 => u32::from(raw) * 1000 + 333,
        _ => u32::from(raw) * 1000,
    }
}

/// Controller state derived from the error counters of the last CAN
/// keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanBusState {
    #[default]
    ErrorActive,
    ErrorWarning,
    ErrorPassive,
    BusOff,
}

impl CanBusState {
    pub fn from_counters(tx_errors: u8, rx_errors: u8, bus_off: bool) -> Self {
        let level = tx_errors.max(rx_errors);
        if bus_off {
            CanBusState::BusOff
        } else if level > MCBA_CAN_STATE_ERR_PSV_TH {
            CanBusState::ErrorPassive
        } else if level > MCBA_CAN_STATE_WRN_TH {
            CanBusState::ErrorWarning
        } else {
            CanBusState::ErrorActive
        }
    }
}

/// Cumulative counters reported by the CAN side firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub tx_error_count: u64,
    pub rx_error_count: u64,
    pub rx_buffer_overflow: u64,
    pub tx_bus_off: u64,
    pub rx_lost: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    pub stats: DeviceStats,
    /// Bits per second, 0 until the first CAN keep-alive.
    pub bitrate: u32,
    pub usb_version: FirmwareVersion,
    pub can_version: FirmwareVersion,
    /// Raw termination state, see [`MCBA_TERMINATION_ENABLED`].
    pub termination_state: u8,
    pub bus_state: CanBusState,
}

impl DeviceStatus {
    pub fn termination_enabled(&self) -> bool {
        self.termination_state != MCBA_TERMINATION_DISABLED
    }

    pub fn clear_stats(&mut self) {
        self.stats = DeviceStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_from_raw() {
        assert_eq!(bitrate_from_raw(33), 33_333);
        assert_eq!(bitrate_from_raw(83), 83_333);
        assert_eq!(bitrate_from_raw(47), 47_000);
        assert_eq!(bitrate_from_raw(1000), 1_000_000);
        assert_eq!(bitrate_from_raw(0), 0);
    }

    #[test]
    fn test_bitrate_catalogue() {
        assert_eq!(Bitrate::try_from(33_333).unwrap(), Bitrate::Kbps33);
        assert_eq!(Bitrate::Kbps500.bps(), 500_000);
        assert!(Bitrate::try_from(47_000).is_err());
    }

    #[test]
    fn test_bus_state() {
        assert_eq!(CanBusState::from_counters(0, 0, false), CanBusState::ErrorActive);
        assert_eq!(CanBusState::from_counters(96, 0, false), CanBusState::ErrorWarning);
        assert_eq!(CanBusState::from_counters(0, 128, false), CanBusState::ErrorPassive);
        assert_eq!(CanBusState::from_counters(0, 0, true), CanBusState::BusOff);
    }
}
