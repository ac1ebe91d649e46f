//! Typed decoding of device responses.
//!
//! Every response payload begins with `[status, sequence]`; the session
//! splits those off and hands the opcode-specific body to a
//! [`DecodeResponse`] implementation.

use crate::device::{DeviceAddress, RebootScheme};
use crate::error::{Error, Result};
use crate::protocol::command::opcode;
use crate::protocol::frame::Frame;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

/// A response frame split into its correlation key and body.
#[derive(Debug, Clone)]
pub struct ResponseParts {
    /// Status byte (0 = success).
    pub status: u8,
    /// Sequence number echoed from the command.
    pub sequence: u8,
    /// Opcode-specific remainder of the payload.
    pub body: Vec<u8>,
}

impl ResponseParts {
    /// Split a parsed response frame. Requires a payload of at least
    /// `[status, sequence]`.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        if frame.is_command || frame.payload.len() < 2 {
            return None;
        }
        Some(Self {
            status: frame.payload[0],
            sequence: frame.payload[1],
            body: frame.payload[2..].to_vec(),
        })
    }
}

/// A typed response decodable from a status byte and body.
pub trait DecodeResponse: Sized + Send {
    /// Opcode whose responses this type decodes.
    const OPCODE: u8;

    /// Decode the response body.
    fn decode(status: u8, body: &[u8]) -> Result<Self>;
}

fn check_status(opcode: u8, status: u8) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::DeviceStatus { opcode, status })
    }
}

fn truncated(what: &str) -> Error {
    Error::Protocol(format!("truncated {what} response"))
}

/// Device identity and capability flags from `GetTargetInfo`.
///
/// Fetched once per connection and refreshed after every reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,
    /// Firmware version string.
    pub version: String,
    /// Numeric firmware version code.
    pub version_code: u32,
    /// Device type identifier.
    pub device_type: u8,
    /// Battery level in percent.
    pub battery: u8,
    /// Whether the device stores firmware in two banks and can flash the
    /// inactive one without a mid-stream reconnect.
    pub dual_bank: bool,
    /// Current Bluetooth address reported by the device.
    pub mac: DeviceAddress,
    /// Communication way currently in use.
    pub communication_way: u8,
    /// Whether the device hands the transfer off to a bootloader.
    pub bootloader_required: bool,
    /// Whether the device demands this upgrade unconditionally.
    pub mandatory_upgrade: bool,
    /// Address-mutation scheme the device uses across its update reboot.
    pub reboot_scheme: RebootScheme,
}

impl DecodeResponse for DeviceInfo {
    const OPCODE: u8 = opcode::GET_TARGET_INFO;

    fn decode(status: u8, body: &[u8]) -> Result<Self> {
        check_status(Self::OPCODE, status)?;
        let mut cur = std::io::Cursor::new(body);

        let mut read_lv_string = |what: &str| -> Result<String> {
            let len = cur.read_u8().map_err(|_| truncated(what))? as usize;
            let mut buf = vec![0u8; len];
            cur.read_exact(&mut buf).map_err(|_| truncated(what))?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        };

        let name = read_lv_string("target-info name")?;
        let version = read_lv_string("target-info version")?;

        let version_code = cur
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated("target-info"))?;
        let device_type = cur.read_u8().map_err(|_| truncated("target-info"))?;
        let battery = cur.read_u8().map_err(|_| truncated("target-info"))?;
        let dual_bank = cur.read_u8().map_err(|_| truncated("target-info"))? != 0;
        let mut mac = [0u8; 6];
        cur.read_exact(&mut mac)
            .map_err(|_| truncated("target-info"))?;
        let communication_way = cur.read_u8().map_err(|_| truncated("target-info"))?;

        // Trailing capability bytes are absent on older firmware.
        let bootloader_required = cur.read_u8().map(|b| b != 0).unwrap_or(false);
        let mandatory_upgrade = cur.read_u8().map(|b| b != 0).unwrap_or(false);
        let reboot_scheme = match cur.read_u8() {
            Ok(b) if b != 0 => RebootScheme::New,
            _ => RebootScheme::Old,
        };

        Ok(Self {
            name,
            version,
            version_code,
            device_type,
            battery,
            dual_bank,
            mac: DeviceAddress(mac),
            communication_way,
            bootloader_required,
            mandatory_upgrade,
            reboot_scheme,
        })
    }
}

/// Resumable file offset from `ReadFileOffset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOffset(pub u32);

impl DecodeResponse for FileOffset {
    const OPCODE: u8 = opcode::READ_FILE_OFFSET;

    fn decode(status: u8, body: &[u8]) -> Result<Self> {
        check_status(Self::OPCODE, status)?;
        if body.len() < 4 {
            return Err(truncated("file-offset"));
        }
        Ok(Self(u32::from_le_bytes([body[0], body[1], body[2], body[3]])))
    }
}

/// Result code from `InquireCanUpdate`: 0 means the image is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePermit(pub u8);

impl UpdatePermit {
    /// Whether the device accepted the image.
    pub fn allowed(self) -> bool {
        self.0 == 0
    }
}

impl DecodeResponse for UpdatePermit {
    const OPCODE: u8 = opcode::INQUIRE_CAN_UPDATE;

    fn decode(status: u8, body: &[u8]) -> Result<Self> {
        check_status(Self::OPCODE, status)?;
        let code = body.first().copied().ok_or_else(|| truncated("can-update"))?;
        Ok(Self(code))
    }
}

/// One-byte result code from `EnterUpdateMode` / `QueryUpdateResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub u8);

impl ResultCode {
    /// Whether the device reported success.
    pub fn ok(self) -> bool {
        self.0 == 0
    }
}

impl DecodeResponse for ResultCode {
    const OPCODE: u8 = opcode::QUERY_UPDATE_RESULT;

    fn decode(status: u8, body: &[u8]) -> Result<Self> {
        // Status carries the verdict on some firmware; body on others.
        if status != 0 {
            return Ok(Self(status));
        }
        Ok(Self(body.first().copied().unwrap_or(0)))
    }
}

/// Result code from `EnterUpdateMode`. Same wire shape as [`ResultCode`]
/// under a different opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterModeAck(pub u8);

impl EnterModeAck {
    /// Whether the device entered update mode.
    pub fn ok(self) -> bool {
        self.0 == 0
    }
}

impl DecodeResponse for EnterModeAck {
    const OPCODE: u8 = opcode::ENTER_UPDATE_MODE;

    fn decode(status: u8, body: &[u8]) -> Result<Self> {
        if status != 0 {
            return Ok(Self(status));
        }
        Ok(Self(body.first().copied().unwrap_or(0)))
    }
}

/// Little-endian status/MTU word from `ChangeCommunicationWay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommWayAck(pub u16);

impl DecodeResponse for CommWayAck {
    const OPCODE: u8 = opcode::CHANGE_COMMUNICATION_WAY;

    fn decode(status: u8, body: &[u8]) -> Result<Self> {
        check_status(Self::OPCODE, status)?;
        if body.len() < 2 {
            return Err(truncated("communication-way"));
        }
        Ok(Self(u16::from_le_bytes([body[0], body[1]])))
    }
}

/// Offset-shaped acknowledgement from `NotifyFileSize`. The body is not
/// interpreted beyond the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeAck;

impl DecodeResponse for SizeAck {
    const OPCODE: u8 = opcode::NOTIFY_FILE_SIZE;

    fn decode(status: u8, _body: &[u8]) -> Result<Self> {
        check_status(Self::OPCODE, status)?;
        Ok(Self)
    }
}
