//! API frame encoding/decoding
//!
//! Frame format:
//! - 1 byte: start delimiter (0x7E)
//! - 2 bytes: length of type + data (big-endian)
//! - 1 byte: frame type
//! - N bytes: frame data
//! - 1 byte: checksum (see [`super::checksum`])
//!
//! The coordinator is normally run without escaping, so a 0x7E inside frame
//! data is indistinguishable from a new frame. [`Escaping::ApiMode2`] switches
//! to the escaped variant for radios configured that way.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use super::{checksum, Address, DeviceRecord, ProtocolError};

/// Marks the start of every frame
pub const START_DELIMITER: u8 = 0x7E;

/// Escape marker used in API mode 2
pub const ESCAPE: u8 = 0x7D;

/// Escaped bytes are XORed with this value
pub const ESCAPE_XOR: u8 = 0x20;

const XON: u8 = 0x11;
const XOFF: u8 = 0x13;

/// Frame type codes
pub mod frame_type {
    /// Transmit request, 64-bit destination address
    pub const TX_REQUEST_64: u8 = 0x00;
    /// Local AT command
    pub const AT_COMMAND: u8 = 0x08;
    /// Response to a local AT command
    pub const AT_COMMAND_RESPONSE: u8 = 0x88;
}

/// AT command asking every reachable radio to identify itself
pub const AT_NODE_DISCOVER: [u8; 2] = *b"ND";

/// Frame id used for every request we originate
pub const DEFAULT_FRAME_ID: u8 = 0x01;

/// The discovery broadcast as it appears on the wire
pub const DISCOVERY_BROADCAST: [u8; 8] = [0x7E, 0x00, 0x04, 0x08, 0x01, 0x4E, 0x44, 0x64];

/// Transmit request bytes between the length field and the application data:
/// type, frame id, 8 address bytes, options
pub const TX_REQUEST_OVERHEAD: usize = 11;

/// A node identification response must be longer than this to carry a record
pub const NODE_ID_MIN_EXCLUSIVE: usize = 20;

// Offsets within a node identification response
const NODE_ID_NETWORK_ADDR: usize = 8;
const NODE_ID_MAC: usize = 10;
const NODE_ID_SIGNAL: usize = 18;
const NODE_ID_NAME: usize = 19;

/// Byte escaping on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escaping {
    /// Bytes are sent as-is (AP=1)
    #[default]
    None,
    /// 0x7E, 0x7D, 0x11 and 0x13 after the delimiter are escaped (AP=2)
    ApiMode2,
}

/// Builder for unescaped API frames
pub struct FrameBuilder {
    frame_type: u8,
    data: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame of the given type
    pub fn new(frame_type: u8) -> Self {
        Self {
            frame_type,
            data: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.data.push(b);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.data.extend_from_slice(data);
        self
    }

    /// Add an 8-byte destination address
    pub fn address(self, address: &Address) -> Self {
        self.bytes(address.as_bytes())
    }

    /// Build the frame: delimiter, length, type, data, checksum
    pub fn build(self) -> Result<Vec<u8>, ProtocolError> {
        let length = self.data.len() + 1;
        if length > u16::MAX as usize {
            return Err(ProtocolError::FrameTooLarge(self.data.len()));
        }

        let mut frame = Vec::with_capacity(length + 4);
        frame.push(START_DELIMITER);

        let mut len_bytes = [0u8; 2];
        BigEndian::write_u16(&mut len_bytes, length as u16);
        frame.extend_from_slice(&len_bytes);

        frame.push(self.frame_type);
        frame.extend_from_slice(&self.data);

        let cs = checksum::compute(&frame, checksum::CHECKSUM_START, frame.len() - 1);
        frame.push(cs);
        Ok(frame)
    }
}

/// Encodes outbound frames and decodes inbound ones
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    escaping: Escaping,
}

impl FrameCodec {
    /// Create a codec for the given API mode
    pub fn new(escaping: Escaping) -> Self {
        Self { escaping }
    }

    /// API mode this codec encodes for
    pub fn escaping(&self) -> Escaping {
        self.escaping
    }

    /// The unaddressed node discovery request
    pub fn encode_broadcast_discovery(&self) -> Vec<u8> {
        // Fixed bytes; escaping leaves them untouched either way
        self.escape(DISCOVERY_BROADCAST.to_vec())
    }

    /// A local AT command for the coordinator itself
    pub fn encode_at_command(
        &self,
        frame_id: u8,
        command: [u8; 2],
        params: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let frame = FrameBuilder::new(frame_type::AT_COMMAND)
            .byte(frame_id)
            .bytes(&command)
            .bytes(params)
            .build()?;
        Ok(self.escape(frame))
    }

    /// A transmit request carrying `command_code` followed by `params` to `target`
    ///
    /// The length field equals the application data length plus
    /// [`TX_REQUEST_OVERHEAD`].
    pub fn encode_transmit_request(
        &self,
        target: &Address,
        command_code: u8,
        params: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let frame = FrameBuilder::new(frame_type::TX_REQUEST_64)
            .byte(DEFAULT_FRAME_ID)
            .address(target)
            .byte(0x00) // options
            .byte(command_code)
            .bytes(params)
            .build()?;
        Ok(self.escape(frame))
    }

    /// Apply the configured escaping to an unescaped frame
    pub fn escape(&self, frame: Vec<u8>) -> Vec<u8> {
        match self.escaping {
            Escaping::None => frame,
            Escaping::ApiMode2 => escape_frame(&frame),
        }
    }

    /// Undo the configured escaping on a slice from [`split_frames`]
    pub fn unescape<'a>(&self, slice: &'a [u8]) -> Cow<'a, [u8]> {
        match self.escaping {
            Escaping::None => Cow::Borrowed(slice),
            Escaping::ApiMode2 if !slice.contains(&ESCAPE) => Cow::Borrowed(slice),
            Escaping::ApiMode2 => Cow::Owned(unescape_frame(slice)),
        }
    }
}

fn needs_escape(b: u8) -> bool {
    matches!(b, START_DELIMITER | ESCAPE | XON | XOFF)
}

fn escape_frame(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 4);
    let Some((&first, rest)) = frame.split_first() else {
        return out;
    };
    out.push(first);
    for &b in rest {
        if needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out
}

fn unescape_frame(slice: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(slice.len());
    let mut iter = slice.iter().copied();
    if let Some(first) = iter.next() {
        out.push(first);
    }
    while let Some(b) = iter.next() {
        if b == ESCAPE {
            // A trailing escape with nothing after it is dropped
            if let Some(next) = iter.next() {
                out.push(next ^ ESCAPE_XOR);
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Split a receive buffer into candidate frames
///
/// Only `buffer[..actual_len]` is scanned. Every delimiter starts a new slice
/// that runs up to the next delimiter; the last slice is yielded even if it is
/// truncated. No length or checksum validation happens here.
pub fn split_frames(buffer: &[u8], actual_len: usize) -> FrameSplitter<'_> {
    let end = actual_len.min(buffer.len());
    FrameSplitter {
        remaining: &buffer[..end],
    }
}

/// Iterator returned by [`split_frames`]. Clone it to restart the scan.
#[derive(Debug, Clone)]
pub struct FrameSplitter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for FrameSplitter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        let end = self.remaining[1..]
            .iter()
            .position(|&b| b == START_DELIMITER)
            .map(|p| p + 1)
            .unwrap_or(self.remaining.len());

        let (head, tail) = self.remaining.split_at(end);
        self.remaining = tail;
        Some(head)
    }
}

/// Extract a device record from a node identification response
///
/// Slices of 20 bytes or fewer yield `None`; partial frames are expected
/// while scanning and are not an error.
pub fn parse_node_identification(slice: &[u8]) -> Option<DeviceRecord> {
    if slice.len() <= NODE_ID_MIN_EXCLUSIVE {
        return None;
    }

    let network_address = BigEndian::read_u16(&slice[NODE_ID_NETWORK_ADDR..NODE_ID_MAC]);
    let address = Address::from_slice(&slice[NODE_ID_MAC..NODE_ID_SIGNAL])?;
    let signal_strength = slice[NODE_ID_SIGNAL];

    // Name runs up to the NUL terminator preceding the checksum
    let name_end = slice.len() - 2;
    let node_name: String = slice[NODE_ID_NAME..name_end]
        .iter()
        .map(|&b| b as char)
        .collect();

    Some(DeviceRecord::new(
        address,
        node_name,
        network_address,
        signal_strength,
    ))
}
