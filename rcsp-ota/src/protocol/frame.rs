//! RCSP wire framing.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------+------+--------+--------+---------------+-------+
//! |     Header     | FLAG | OPCODE | Length |    Payload    | Trail |
//! +----------------+------+--------+--------+---------------+-------+
//! |    3 bytes     |  1   |   1    | 2 (BE) |   variable    |   1   |
//! +----------------+------+--------+--------+---------------+-------+
//! | 0xFE 0xDC 0xBA | bits |  cmd   |  len   |    payload    | 0xEF  |
//! +----------------+------+--------+--------+---------------+-------+
//! ```
//!
//! FLAG bit 7 marks a command (as opposed to a response), bit 6 marks a
//! command that expects a response. Total frame length is always
//! `8 + payload length`.

use byteorder::{BigEndian, ByteOrder};
use log::{trace, warn};

/// Frame header signature.
pub const FRAME_HEADER: [u8; 3] = [0xFE, 0xDC, 0xBA];

/// Frame trailer byte.
pub const FRAME_TRAILER: u8 = 0xEF;

/// Smallest possible frame: header + flag + opcode + length + trailer.
pub const MIN_FRAME_LEN: usize = 8;

/// FLAG bit marking a command frame.
pub const FLAG_COMMAND: u8 = 0x80;

/// FLAG bit marking a command that expects a response.
pub const FLAG_NEEDS_RESPONSE: u8 = 0x40;

/// Hard cap on the reassembly buffer. Exceeding it clears the buffer
/// unconditionally; the upper layer recovers via retransmission or timeout.
pub const MAX_BUFFER_LEN: usize = 4096;

/// A parsed RCSP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether this frame carries a command (vs. a response).
    pub is_command: bool,
    /// Whether the sender expects a response to this frame.
    pub needs_response: bool,
    /// Command/response opcode.
    pub opcode: u8,
    /// Opcode-specific payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a command frame.
    pub fn command(opcode: u8, needs_response: bool, payload: Vec<u8>) -> Self {
        Self {
            is_command: true,
            needs_response,
            opcode,
            payload,
        }
    }

    /// Create a response frame.
    pub fn response(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            is_command: false,
            needs_response: false,
            opcode,
            payload,
        }
    }

    /// Serialize the frame. Deterministic; the payload length is asserted to
    /// fit 16 bits by construction of the command layer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= u16::MAX as usize);

        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        buf.extend_from_slice(&FRAME_HEADER);

        let mut flag = 0u8;
        if self.is_command {
            flag |= FLAG_COMMAND;
        }
        if self.needs_response {
            flag |= FLAG_NEEDS_RESPONSE;
        }
        buf.push(flag);
        buf.push(self.opcode);

        let mut len = [0u8; 2];
        BigEndian::write_u16(&mut len, self.payload.len() as u16);
        buf.extend_from_slice(&len);

        buf.extend_from_slice(&self.payload);
        buf.push(FRAME_TRAILER);
        buf
    }

    /// Parse one complete frame from `data`.
    ///
    /// Returns `None` on short input, header or trailer mismatch, or when the
    /// declared payload length does not match the actual remaining bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MIN_FRAME_LEN {
            return None;
        }
        if data[0..3] != FRAME_HEADER {
            return None;
        }

        let payload_len = BigEndian::read_u16(&data[5..7]) as usize;
        if data.len() != MIN_FRAME_LEN + payload_len {
            return None;
        }
        if data[7 + payload_len] != FRAME_TRAILER {
            return None;
        }

        let flag = data[3];
        Some(Self {
            is_command: flag & FLAG_COMMAND != 0,
            needs_response: flag & FLAG_NEEDS_RESPONSE != 0,
            opcode: data[4],
            payload: data[7..7 + payload_len].to_vec(),
        })
    }
}

/// Streaming frame reassembler.
///
/// Notifications from the transport may split a frame across any number of
/// receives, or pack several frames into one. The assembler accumulates
/// bytes and yields every complete frame it can extract.
///
/// Resync policy is aggressive: when no header signature is present the
/// whole buffer is dropped rather than retried byte by byte. The scan
/// accepts a position on the first two header bytes and validates the third
/// during extraction; a coincidental two-byte match is discarded like any
/// other malformed frame.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed received bytes and extract every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_BUFFER_LEN {
            warn!(
                "Reassembly buffer exceeded {MAX_BUFFER_LEN} bytes ({}); dropping it",
                self.buffer.len()
            );
            self.buffer.clear();
            return Vec::new();
        }

        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < 2 {
                break; // too short to scan, keep buffering
            }

            // Resync on the first two header bytes; the third is checked by
            // Frame::parse after extraction.
            let Some(start) = self
                .buffer
                .windows(2)
                .position(|w| w == &FRAME_HEADER[..2])
            else {
                if !self.buffer.is_empty() {
                    trace!("No header in {} buffered bytes; dropping them", self.buffer.len());
                    self.buffer.clear();
                }
                break;
            };

            if start > 0 {
                trace!("Discarding {start} bytes before header");
                self.buffer.drain(..start);
            }

            if self.buffer.len() < MIN_FRAME_LEN {
                break; // incomplete, keep buffering
            }

            let payload_len = BigEndian::read_u16(&self.buffer[5..7]) as usize;
            let total = MIN_FRAME_LEN + payload_len;
            if self.buffer.len() < total {
                break; // trailer not yet received
            }

            let candidate: Vec<u8> = self.buffer.drain(..total).collect();
            match Frame::parse(&candidate) {
                Some(frame) => frames.push(frame),
                None => {
                    // Bytes are already consumed; the upper layer recovers
                    // via retransmission or timeout.
                    warn!("Discarding malformed frame ({total} bytes)");
                },
            }
        }

        frames
    }
}
