use std::io;

use thiserror::Error;

/// Outcome of a failed driver operation.
///
/// Errors are reported to the request that caused them; none of them halts
/// the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Insufficient resources: {0}")]
    ResourceExhausted(&'static str),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Incomplete write: {written} of {expected} bytes transferred")]
    IncompleteWrite { written: usize, expected: usize },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A blocking read is already pending on this client")]
    ReadAlreadyPending,

    #[error("Operation not implemented")]
    NotImplemented,

    #[error("Unsupported platform: host byte order is neither little nor big endian")]
    UnsupportedPlatform,

    #[error("Device stopped")]
    DeviceStopped,
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl From<io::Error> for DriverError {
    fn from(error: io::Error) -> Self {
        Self::TransportFailure(error.to_string())
    }
}

impl From<tokio::sync::AcquireError> for DriverError {
    fn from(_: tokio::sync::AcquireError) -> Self {
        Self::DeviceStopped
    }
}
