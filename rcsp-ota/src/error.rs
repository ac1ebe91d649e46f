//! Error types for rcsp-ota.

use std::io;
use thiserror::Error;

/// Result type for rcsp-ota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for rcsp-ota operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (firmware file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Firmware file failed validation.
    #[error("Invalid firmware: {0}")]
    FirmwareInvalid(String),

    /// Initial connection to the device failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The device did not reappear within the reconnect timeout.
    #[error("Device did not reconnect in time")]
    ReconnectTimeout,

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol error (malformed frame, unexpected response).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device reported a non-zero status byte for a command.
    #[error("Device reported status {status:#04x} for opcode {opcode:#04x}")]
    DeviceStatus {
        /// Opcode of the failed command.
        opcode: u8,
        /// Status byte reported by the device.
        status: u8,
    },

    /// Device refused the firmware image.
    #[error("Device rejected the update (code {0:#04x})")]
    UpdateRejected(u8),

    /// The protocol session was initialized twice.
    #[error("Session already initialized")]
    AlreadyInitialized,

    /// An upgrade is already running on this updater.
    #[error("An upgrade is already in progress")]
    UpgradeInProgress,

    /// Session state required for this step is missing.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The upgrade was cancelled by the caller.
    #[error("Upgrade cancelled")]
    Cancelled,

    /// Transport-level failure (write, scan, subscription).
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Closed set of numeric error codes carried by the final upgrade result.
///
/// Codes are stable across releases; UIs key their messages off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OtaErrorCode {
    /// Upgrade completed successfully.
    Success = 0,
    /// Firmware file missing, empty, or oversized.
    InvalidFirmware = 1,
    /// Could not connect to the device.
    ConnectFailed = 2,
    /// A command timed out waiting for the device.
    Timeout = 3,
    /// Wire-level protocol failure.
    Protocol = 4,
    /// The device reported a failure code.
    DeviceRejected = 5,
    /// The device never reappeared after reboot.
    ReconnectFailed = 6,
    /// The caller cancelled the upgrade.
    Cancelled = 7,
    /// Internal invariant violation.
    Internal = 8,
}

impl OtaErrorCode {
    /// Human-readable description of this code.
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "upgrade completed",
            Self::InvalidFirmware => "firmware file is missing, empty or too large",
            Self::ConnectFailed => "failed to connect to the device",
            Self::Timeout => "timed out waiting for the device",
            Self::Protocol => "protocol error",
            Self::DeviceRejected => "the device reported an error",
            Self::ReconnectFailed => "the device did not reconnect after reboot",
            Self::Cancelled => "upgrade cancelled by the user",
            Self::Internal => "internal error",
        }
    }

    /// Numeric value of this code.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<&Error> for OtaErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Io(_) | Error::FirmwareInvalid(_) => Self::InvalidFirmware,
            Error::ConnectFailed(_) | Error::Transport(_) => Self::ConnectFailed,
            Error::ReconnectTimeout => Self::ReconnectFailed,
            Error::Timeout(_) => Self::Timeout,
            Error::Protocol(_) => Self::Protocol,
            Error::DeviceStatus { .. } | Error::UpdateRejected(_) => Self::DeviceRejected,
            Error::Cancelled => Self::Cancelled,
            Error::AlreadyInitialized | Error::UpgradeInProgress | Error::NotReady(_) => {
                Self::Internal
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values_are_stable() {
        assert_eq!(OtaErrorCode::Success.code(), 0);
        assert_eq!(OtaErrorCode::InvalidFirmware.code(), 1);
        assert_eq!(OtaErrorCode::ConnectFailed.code(), 2);
        assert_eq!(OtaErrorCode::Timeout.code(), 3);
        assert_eq!(OtaErrorCode::Protocol.code(), 4);
        assert_eq!(OtaErrorCode::DeviceRejected.code(), 5);
        assert_eq!(OtaErrorCode::ReconnectFailed.code(), 6);
        assert_eq!(OtaErrorCode::Cancelled.code(), 7);
        assert_eq!(OtaErrorCode::Internal.code(), 8);
    }

    #[test]
    fn test_error_maps_to_code() {
        assert_eq!(
            OtaErrorCode::from(&Error::Timeout("x".into())),
            OtaErrorCode::Timeout
        );
        assert_eq!(OtaErrorCode::from(&Error::Cancelled), OtaErrorCode::Cancelled);
        assert_eq!(
            OtaErrorCode::from(&Error::DeviceStatus {
                opcode: 0xE3,
                status: 1
            }),
            OtaErrorCode::DeviceRejected
        );
        assert_eq!(
            OtaErrorCode::from(&Error::UpgradeInProgress),
            OtaErrorCode::Internal
        );
    }

    #[test]
    fn test_every_code_has_description() {
        for code in [
            OtaErrorCode::Success,
            OtaErrorCode::InvalidFirmware,
            OtaErrorCode::ConnectFailed,
            OtaErrorCode::Timeout,
            OtaErrorCode::Protocol,
            OtaErrorCode::DeviceRejected,
            OtaErrorCode::ReconnectFailed,
            OtaErrorCode::Cancelled,
            OtaErrorCode::Internal,
        ] {
            assert!(!code.description().is_empty());
        }
    }
}
