use crate::adaptor::{DriverError, Result, MAX_SLOTS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Transfer slots shared by all writers, at most 16.
    pub slot_count: usize,
    /// Frames buffered per client before the oldest is dropped.
    pub read_queue_capacity: usize,
    /// Bytes per page of the received frame pool.
    pub message_page_size: usize,
    /// Cap on received frame pages. `None` grows without bound.
    pub max_message_pages: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            slot_count: MAX_SLOTS,
            read_queue_capacity: 128,
            message_page_size: 4096,
            max_message_pages: None,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOTS {
            return Err(DriverError::InvalidArgument(format!(
                "slot count {} not in 1..={}",
                self.slot_count, MAX_SLOTS
            )));
        }
        if self.read_queue_capacity == 0 {
            return Err(DriverError::InvalidArgument(
                "read queue capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(DeviceConfig::default().validate().is_ok());
        for config in [
            DeviceConfig {
                slot_count: 0,
                ..Default::default()
            },
            DeviceConfig {
                slot_count: 17,
                ..Default::default()
            },
            DeviceConfig {
                read_queue_capacity: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(DriverError::InvalidArgument(_))
            ));
        }
        let small = DeviceConfig {
            slot_count: 1,
            read_queue_capacity: 1,
            message_page_size: 0,
            max_message_pages: Some(1),
        };
        assert!(small.validate().is_ok());
    }
}
