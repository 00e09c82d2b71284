//! Result codes and transport errors for the tuner device protocol.

use thiserror::Error;

/// First code of the vendor-specific sub-range.
pub const OEM_RANGE_START: i32 = 0x1000;
/// Last code of the vendor-specific sub-range.
pub const OEM_RANGE_END: i32 = 0x1FFF;

/// Result code carried by every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Operation succeeded.
    Success,
    /// The resource is not present or currently unusable.
    Unavailable,
    /// The resource was used before being configured.
    NotInitialized,
    /// The request is not valid in the current state.
    InvalidState,
    /// A request argument was rejected.
    InvalidArgument,
    /// The device ran out of memory.
    OutOfMemory,
    /// Unknown error occurred.
    UnknownError,
    /// The feature is optional and not implemented by the device.
    NotSupported,
    /// Vendor-specific code inside the OEM sub-range.
    Oem(i32),
}

impl From<i32> for ResultCode {
    fn from(value: i32) -> Self {
        match value {
            0 => ResultCode::Success,
            1 => ResultCode::Unavailable,
            2 => ResultCode::NotInitialized,
            3 => ResultCode::InvalidState,
            4 => ResultCode::InvalidArgument,
            5 => ResultCode::OutOfMemory,
            7 => ResultCode::NotSupported,
            OEM_RANGE_START..=OEM_RANGE_END => ResultCode::Oem(value),
            _ => ResultCode::UnknownError,
        }
    }
}

impl From<ResultCode> for i32 {
    fn from(value: ResultCode) -> Self {
        match value {
            ResultCode::Success => 0,
            ResultCode::Unavailable => 1,
            ResultCode::NotInitialized => 2,
            ResultCode::InvalidState => 3,
            ResultCode::InvalidArgument => 4,
            ResultCode::OutOfMemory => 5,
            ResultCode::UnknownError => 6,
            ResultCode::NotSupported => 7,
            ResultCode::Oem(code) => code,
        }
    }
}

impl ResultCode {
    /// Returns true if this result code indicates success.
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// Returns true for codes inside the vendor-specific sub-range.
    pub fn is_oem(self) -> bool {
        matches!(self, ResultCode::Oem(_))
    }
}

/// Failures of the transport itself, before the device produced a result code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The device endpoint is gone.
    #[error("Device disconnected")]
    Disconnected,

    /// The request could not be delivered.
    #[error("Request rejected by transport: {0}")]
    Rejected(String),

    /// The device is shutting down and accepts no more requests.
    #[error("Device is shutting down")]
    ShuttingDown,
}

/// Errors raised by [`crate::StreamQueue`] misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// More bytes were committed than the transaction reserved.
    #[error("Commit of {committed} bytes exceeds the {reserved} bytes reserved")]
    CommitOverrun { committed: usize, reserved: usize },
}

/// Outcome of an unsuccessful [`crate::EventFlag::wait`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagWaitError {
    /// None of the requested bits were raised before the deadline.
    #[error("Timed out waiting for event flag")]
    TimedOut,

    /// Woken without any requested bit set and retries were disabled.
    #[error("Spurious event flag wake")]
    Spurious,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_conversion() {
        for code in [
            ResultCode::Success,
            ResultCode::Unavailable,
            ResultCode::InvalidState,
            ResultCode::NotSupported,
            ResultCode::Oem(0x1234),
        ] {
            assert_eq!(ResultCode::from(i32::from(code)), code);
        }
        assert_eq!(ResultCode::from(0x2000), ResultCode::UnknownError);
        assert!(ResultCode::Oem(OEM_RANGE_START).is_oem());
        assert!(ResultCode::Success.is_success());
        assert!(!ResultCode::Unavailable.is_success());
    }
}
