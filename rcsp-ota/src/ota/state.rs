//! Upgrade session states, progress reporting and the final outcome.

use crate::error::OtaErrorCode;
use crate::protocol::response::DeviceInfo;
use std::fmt;
use std::time::Duration;

/// Phase of an upgrade session.
///
/// Created in `Idle`, mutated only by the orchestrator, observed through
/// the event channel. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    /// No session running.
    Idle,
    /// Checking the firmware file.
    ValidatingFirmware,
    /// Establishing the initial connection.
    Connecting,
    /// Fetching device capabilities.
    GettingDeviceInfo,
    /// Reading the resumable file offset (and inquiring acceptance).
    ReadingFileOffset,
    /// Entering update mode and announcing the file size.
    EnteringUpdateMode,
    /// Serving device-initiated file-block requests.
    TransferringFile,
    /// Waiting for the device to reboot and reappear.
    WaitingReconnect,
    /// Asking the device for the final verdict.
    QueryingResult,
    /// Upgrade finished successfully.
    Completed,
    /// Upgrade failed.
    Failed,
    /// Upgrade cancelled by the caller.
    Cancelled,
}

impl OtaState {
    /// Whether this state ends the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ValidatingFirmware => "validating firmware",
            Self::Connecting => "connecting",
            Self::GettingDeviceInfo => "getting device info",
            Self::ReadingFileOffset => "reading file offset",
            Self::EnteringUpdateMode => "entering update mode",
            Self::TransferringFile => "transferring file",
            Self::WaitingReconnect => "waiting for reconnect",
            Self::QueryingResult => "querying result",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Transfer progress, emitted on every accepted file-block exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Total firmware size in bytes.
    pub total_bytes: u64,
    /// Bytes handed to the device so far.
    pub transferred_bytes: u64,
    /// Completion percentage, 0.0 to 100.0.
    pub percentage: f64,
    /// Throughput since transfer start, bytes per second.
    pub bytes_per_sec: f64,
}

impl Progress {
    /// Compute progress from byte counts and elapsed transfer time.
    pub fn new(total_bytes: u64, transferred_bytes: u64, elapsed: Duration) -> Self {
        let percentage = if total_bytes == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                transferred_bytes as f64 / total_bytes as f64 * 100.0
            }
        };
        let secs = elapsed.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let bytes_per_sec = if secs > 0.0 {
            transferred_bytes as f64 / secs
        } else {
            0.0
        };
        Self {
            total_bytes,
            transferred_bytes,
            percentage,
            bytes_per_sec,
        }
    }
}

/// Events published by the orchestrator.
#[derive(Debug, Clone)]
pub enum OtaEvent {
    /// The session moved to a new state.
    State(OtaState),
    /// Transfer progress changed.
    Progress(Progress),
}

/// Final result of an upgrade session.
#[derive(Debug, Clone)]
pub struct OtaOutcome {
    /// Whether the upgrade completed successfully.
    pub success: bool,
    /// Numeric error code (`Success` when `success`).
    pub code: OtaErrorCode,
    /// Human-readable summary.
    pub message: String,
    /// Last device information fetched during the session, if any.
    pub device_info: Option<DeviceInfo>,
    /// Terminal state the session ended in.
    pub final_state: OtaState,
    /// Wall-clock duration of the session.
    pub elapsed: Duration,
}
