//! Typed encoding of host-side RCSP commands.
//!
//! A command payload is always `[sequence] ++ command-specific bytes`; the
//! sequence number is assigned by the session at send time.

use crate::protocol::frame::Frame;
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

/// RCSP opcodes.
pub mod opcode {
    /// Fetch device name, version and capability flags.
    pub const GET_TARGET_INFO: u8 = 0x02;
    /// Ask the device for the current resumable file offset.
    pub const READ_FILE_OFFSET: u8 = 0xE1;
    /// Ask the device whether the firmware image is acceptable.
    pub const INQUIRE_CAN_UPDATE: u8 = 0xE2;
    /// Switch the device into update mode.
    pub const ENTER_UPDATE_MODE: u8 = 0xE3;
    /// Leave update mode.
    pub const EXIT_UPDATE_MODE: u8 = 0xE4;
    /// Device-initiated request for a firmware block.
    pub const FILE_BLOCK: u8 = 0xE5;
    /// Ask the device for the final update result.
    pub const QUERY_UPDATE_RESULT: u8 = 0xE6;
    /// Reboot the device.
    pub const REBOOT_DEVICE: u8 = 0xE7;
    /// Announce the firmware size (and resume offset) to the device.
    pub const NOTIFY_FILE_SIZE: u8 = 0xE8;
    /// Switch the communication mode / negotiate the transfer unit.
    pub const CHANGE_COMMUNICATION_WAY: u8 = 0xD1;
}

/// Status byte for a successful response.
pub const STATUS_OK: u8 = 0x00;

/// Status byte for a failed response.
pub const STATUS_FAIL: u8 = 0x01;

/// A host-issued RCSP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch device information and capability flags.
    GetTargetInfo {
        /// Bitmask selecting the requested attribute groups.
        mask: u32,
        /// Host platform identifier.
        platform: u8,
    },
    /// Read the device's resumable file offset.
    ReadFileOffset,
    /// Ask whether the device accepts this firmware image.
    InquireCanUpdate {
        /// Leading bytes of the firmware image.
        header: Vec<u8>,
    },
    /// Enter update mode.
    EnterUpdateMode,
    /// Exit update mode.
    ExitUpdateMode,
    /// Query the final update result.
    QueryUpdateResult,
    /// Reboot the device.
    RebootDevice {
        /// Operation code understood by the firmware.
        op: u8,
    },
    /// Announce total firmware size, optionally with the current offset when
    /// resuming after a reconnect.
    NotifyFileSize {
        /// Total firmware size in bytes.
        size: u32,
        /// Resume offset, when continuing an interrupted transfer.
        offset: Option<u32>,
    },
    /// Switch communication mode and advertise reboot-scheme support.
    ChangeCommunicationWay {
        /// Requested communication way.
        way: u8,
        /// Whether the host understands the new reboot address scheme.
        supports_new_reboot: bool,
    },
}

impl Command {
    /// The opcode this command is sent under.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::GetTargetInfo { .. } => opcode::GET_TARGET_INFO,
            Self::ReadFileOffset => opcode::READ_FILE_OFFSET,
            Self::InquireCanUpdate { .. } => opcode::INQUIRE_CAN_UPDATE,
            Self::EnterUpdateMode => opcode::ENTER_UPDATE_MODE,
            Self::ExitUpdateMode => opcode::EXIT_UPDATE_MODE,
            Self::QueryUpdateResult => opcode::QUERY_UPDATE_RESULT,
            Self::RebootDevice { .. } => opcode::REBOOT_DEVICE,
            Self::NotifyFileSize { .. } => opcode::NOTIFY_FILE_SIZE,
            Self::ChangeCommunicationWay { .. } => opcode::CHANGE_COMMUNICATION_WAY,
        }
    }

    /// Whether the device answers this command.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::ExitUpdateMode | Self::RebootDevice { .. })
    }

    /// Encode into a wire frame carrying `sequence`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self, sequence: u8) -> Frame {
        let mut payload = vec![sequence];

        match self {
            Self::GetTargetInfo { mask, platform } => {
                payload.write_u32::<BigEndian>(*mask).unwrap();
                payload.push(*platform);
            },
            Self::InquireCanUpdate { header } => {
                payload.extend_from_slice(header);
            },
            Self::RebootDevice { op } => {
                payload.push(*op);
            },
            Self::NotifyFileSize { size, offset } => {
                payload.write_u32::<BigEndian>(*size).unwrap();
                if let Some(offset) = offset {
                    payload.write_u32::<BigEndian>(*offset).unwrap();
                }
            },
            Self::ChangeCommunicationWay {
                way,
                supports_new_reboot,
            } => {
                payload.push(*way);
                payload.push(u8::from(*supports_new_reboot));
            },
            Self::ReadFileOffset
            | Self::EnterUpdateMode
            | Self::ExitUpdateMode
            | Self::QueryUpdateResult => {},
        }

        Frame::command(self.opcode(), self.expects_response(), payload)
    }
}

/// A device-initiated request for a slice of the firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBlockRequest {
    /// Sequence number chosen by the device; echoed in the host's reply.
    pub sequence: u8,
    /// Requested offset into the firmware image.
    pub offset: u32,
    /// Requested length in bytes.
    pub length: u16,
}

impl FileBlockRequest {
    /// Parse a device-initiated file-block command frame.
    pub fn parse(frame: &Frame) -> Option<Self> {
        if !frame.is_command || frame.opcode != opcode::FILE_BLOCK {
            return None;
        }
        let p = &frame.payload;
        if p.len() < 7 {
            return None;
        }
        Some(Self {
            sequence: p[0],
            offset: u32::from_le_bytes([p[1], p[2], p[3], p[4]]),
            length: u16::from_le_bytes([p[5], p[6]]),
        })
    }

    /// Whether this is the sentinel "query result" request rather than a
    /// data request.
    pub fn is_sentinel(&self) -> bool {
        self.offset == 0 && self.length == 0
    }

    /// Build the host's reply carrying `data` (empty on the sentinel or on
    /// failure).
    ///
    /// `data` never exceeds the requested length, which fits 16 bits.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn reply(&self, status: u8, data: &[u8]) -> Frame {
        let mut payload = vec![status, self.sequence];
        payload.write_u32::<LittleEndian>(self.offset).unwrap();
        payload
            .write_u16::<LittleEndian>(data.len() as u16)
            .unwrap();
        payload.extend_from_slice(data);
        Frame::response(opcode::FILE_BLOCK, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_payload_starts_with_sequence() {
        let frame = Command::EnterUpdateMode.encode(0x42);
        assert_eq!(frame.opcode, opcode::ENTER_UPDATE_MODE);
        assert_eq!(frame.payload, vec![0x42]);
        assert!(frame.is_command);
        assert!(frame.needs_response);
    }

    #[test]
    fn test_get_target_info_layout() {
        let frame = Command::GetTargetInfo {
            mask: 0xFFFF_FFFF,
            platform: 0x02,
        }
        .encode(1);
        assert_eq!(frame.payload, vec![1, 0xFF, 0xFF, 0xFF, 0xFF, 0x02]);
    }

    #[test]
    fn test_notify_file_size_layout() {
        let frame = Command::NotifyFileSize {
            size: 0x0102_0304,
            offset: None,
        }
        .encode(9);
        assert_eq!(frame.payload, vec![9, 0x01, 0x02, 0x03, 0x04]);

        let frame = Command::NotifyFileSize {
            size: 0x0102_0304,
            offset: Some(0x0000_1000),
        }
        .encode(9);
        assert_eq!(
            frame.payload,
            vec![9, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x10, 0x00]
        );
    }

    #[test]
    fn test_change_communication_way_layout() {
        let frame = Command::ChangeCommunicationWay {
            way: 0x01,
            supports_new_reboot: true,
        }
        .encode(3);
        assert_eq!(frame.payload, vec![3, 0x01, 0x01]);
    }

    #[test]
    fn test_no_response_commands() {
        assert!(!Command::ExitUpdateMode.expects_response());
        assert!(!Command::RebootDevice { op: 0 }.expects_response());
        assert!(Command::QueryUpdateResult.expects_response());

        let frame = Command::RebootDevice { op: 0 }.encode(0);
        assert!(!frame.needs_response);
    }

    #[test]
    fn test_file_block_request_parse() {
        let frame = Frame::command(
            opcode::FILE_BLOCK,
            true,
            vec![7, 0x00, 0x10, 0x00, 0x00, 0x00, 0x02],
        );
        let req = FileBlockRequest::parse(&frame).unwrap();
        assert_eq!(req.sequence, 7);
        assert_eq!(req.offset, 0x1000);
        assert_eq!(req.length, 0x200);
        assert!(!req.is_sentinel());
    }

    #[test]
    fn test_file_block_request_rejects_short_or_foreign_frames() {
        let short = Frame::command(opcode::FILE_BLOCK, true, vec![7, 0, 0]);
        assert!(FileBlockRequest::parse(&short).is_none());

        let response = Frame::response(opcode::FILE_BLOCK, vec![7, 0, 0, 0, 0, 0, 0]);
        assert!(FileBlockRequest::parse(&response).is_none());

        let other = Frame::command(opcode::ENTER_UPDATE_MODE, true, vec![7, 0, 0, 0, 0, 0, 0]);
        assert!(FileBlockRequest::parse(&other).is_none());
    }

    #[test]
    fn test_sentinel_detection() {
        let frame = Frame::command(opcode::FILE_BLOCK, true, vec![1, 0, 0, 0, 0, 0, 0]);
        let req = FileBlockRequest::parse(&frame).unwrap();
        assert!(req.is_sentinel());
    }

    #[test]
    fn test_file_block_reply_layout() {
        let req = FileBlockRequest {
            sequence: 5,
            offset: 0x0000_0100,
            length: 4,
        };
        let frame = req.reply(STATUS_OK, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(!frame.is_command);
        assert_eq!(frame.opcode, opcode::FILE_BLOCK);
        assert_eq!(
            frame.payload,
            vec![0x00, 5, 0x00, 0x01, 0x00, 0x00, 0x04, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }
}
