//! MSP message encoding/decoding
//!
//! Frame layouts:
//!
//! MSP v2:
//! - 1 byte: marker `$`
//! - 1 byte: format `X`
//! - 1 byte: direction (`<` request, `>` response, `!` error)
//! - 1 byte: flags
//! - 2 bytes: function (little-endian)
//! - 2 bytes: payload size (little-endian)
//! - N bytes: payload
//! - 1 byte: CRC-8/DVB-S2 of flags..payload
//!
//! MSP v1:
//! - 1 byte: marker `$`
//! - 1 byte: format `M`
//! - 1 byte: direction
//! - 1 byte: payload size
//! - 1 byte: function
//! - N bytes: payload
//! - 1 byte: XOR of size..payload

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::checksum::{v1_checksum, v1_checksum_parts, v2_checksum, v2_checksum_parts};
use super::records::{PayloadFit, PayloadRecord};
use super::{Function, ProtocolError, CHECKSUM_SIZE, FRAME_MARKER};

/// Offset of the first checksummed byte in both layouts
const CHECKSUM_START: usize = 3;

/// Largest payload either layout can describe
pub const WIRE_PAYLOAD_LIMIT: usize = u16::MAX as usize;

/// Wire format variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireVersion {
    /// `$M` frames, 8-bit size and function, XOR checksum
    V1,
    /// `$X` frames, 16-bit size and function, CRC-8 checksum
    #[default]
    V2,
}

impl WireVersion {
    /// Format byte following the marker
    pub fn format_byte(&self) -> u8 {
        match self {
            WireVersion::V1 => b'M',
            WireVersion::V2 => b'X',
        }
    }

    /// Detect the variant from a format byte
    pub fn from_format_byte(byte: u8) -> Option<Self> {
        match byte {
            b'M' => Some(WireVersion::V1),
            b'X' => Some(WireVersion::V2),
            _ => None,
        }
    }

    /// Size of the fixed header, marker included
    pub fn header_size(&self) -> usize {
        match self {
            WireVersion::V1 => 5,
            WireVersion::V2 => 8,
        }
    }

    /// Header plus trailing checksum
    pub fn overhead(&self) -> usize {
        self.header_size() + CHECKSUM_SIZE
    }

    /// Largest payload the size field can express
    pub fn payload_limit(&self) -> usize {
        match self {
            WireVersion::V1 => u8::MAX as usize,
            WireVersion::V2 => WIRE_PAYLOAD_LIMIT,
        }
    }

    /// Run this variant's checksum over `data`
    pub fn checksum(&self, data: &[u8]) -> u8 {
        match self {
            WireVersion::V1 => v1_checksum(data),
            WireVersion::V2 => v2_checksum(data),
        }
    }
}

/// Message direction byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `<`: sent by the onboard computer
    Request,
    /// `>`: answer from the flight controller
    Response,
    /// `!`: the flight controller could not process the request
    Error,
}

impl Direction {
    /// Wire byte for this direction
    pub fn as_byte(&self) -> u8 {
        match self {
            Direction::Request => b'<',
            Direction::Response => b'>',
            Direction::Error => b'!',
        }
    }

    /// Direction for a wire byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'<' => Some(Direction::Request),
            b'>' => Some(Direction::Response),
            b'!' => Some(Direction::Error),
            _ => None,
        }
    }
}

/// Fixed header fields of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Layout, from the format byte
    pub version: WireVersion,
    /// Direction byte
    pub direction: Direction,
    /// Always 0 for v1
    pub flags: u8,
    /// Function id
    pub function: Function,
    /// Declared payload size
    pub payload_len: usize,
}

impl FrameHeader {
    /// Parse the header at the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` is too short to tell, never an error for
    /// a merely incomplete header. Payload sizes above `max_payload` are
    /// rejected before anything is copied.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<Self>, ProtocolError> {
        let Some(&marker) = buf.first() else {
            return Ok(None);
        };
        if marker != FRAME_MARKER {
            return Err(ProtocolError::BadMarker(marker));
        }

        let Some(&format) = buf.get(1) else {
            return Ok(None);
        };
        let version =
            WireVersion::from_format_byte(format).ok_or(ProtocolError::BadFormat(format))?;

        let Some(&dir) = buf.get(2) else {
            return Ok(None);
        };
        let direction = Direction::from_byte(dir).ok_or(ProtocolError::BadDirection(dir))?;

        if buf.len() < version.header_size() {
            return Ok(None);
        }

        let (flags, function, payload_len) = match version {
            WireVersion::V1 => (0, Function(buf[4] as u16), buf[3] as usize),
            WireVersion::V2 => (
                buf[3],
                Function(LittleEndian::read_u16(&buf[4..6])),
                LittleEndian::read_u16(&buf[6..8]) as usize,
            ),
        };

        if payload_len > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: max_payload,
            });
        }

        Ok(Some(Self {
            version,
            direction,
            flags,
            function,
            payload_len,
        }))
    }

    /// Total encoded size of the frame this header describes
    pub fn frame_len(&self) -> usize {
        self.version.overhead() + self.payload_len
    }
}

/// One MSP message.
///
/// The checksum is derived: every setter recomputes it, so a `Message` is
/// always consistent with its own content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    version: WireVersion,
    direction: Direction,
    flags: u8,
    function: Function,
    payload: Vec<u8>,
    checksum: u8,
}

impl Message {
    /// Create an empty v2 request for `function`
    pub fn new(function: Function) -> Self {
        Self::with_version(WireVersion::V2, function)
    }

    /// Create an empty request for `function` in the given layout
    pub fn with_version(version: WireVersion, function: Function) -> Self {
        let mut msg = Self {
            version,
            direction: Direction::Request,
            flags: 0,
            function,
            payload: Vec::new(),
            checksum: 0,
        };
        msg.recompute();
        msg
    }

    /// Create a request carrying `payload`
    pub fn request(function: Function, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut msg = Self::new(function);
        msg.set_payload(payload)?;
        Ok(msg)
    }

    /// Layout the message encodes to
    pub fn version(&self) -> WireVersion {
        self.version
    }

    /// Request, response or error
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// v2 flags byte; always 0 for v1
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Function id
    pub fn function(&self) -> Function {
        self.function
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Checksum of the current content
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Switch layout, keeping direction, function and payload
    pub fn set_version(&mut self, version: WireVersion) {
        self.version = version;
        self.recompute();
    }

    /// Change the direction; the checksum follows
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
        self.recompute();
    }

    /// Change the function id; the checksum follows
    pub fn set_function(&mut self, function: Function) {
        self.function = function;
        self.recompute();
    }

    /// Replace the payload
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > WIRE_PAYLOAD_LIMIT {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: WIRE_PAYLOAD_LIMIT,
            });
        }
        self.payload.clear();
        self.payload.extend_from_slice(payload);
        self.recompute();
        Ok(())
    }

    /// Whether this message can be expressed in its current layout
    pub fn is_encodable(&self) -> bool {
        let fits_function = match self.version {
            WireVersion::V1 => self.function.fits_v1(),
            WireVersion::V2 => true,
        };
        fits_function && self.payload.len() <= self.version.payload_limit()
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        self.version.overhead() + self.payload.len()
    }

    /// Encode the full wire frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if !self.is_encodable() {
            return Err(ProtocolError::Unencodable {
                function: self.function,
            });
        }

        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.extend_from_slice(&self.header_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.push(self.checksum);
        Ok(bytes)
    }

    /// Decode one frame starting at `offset`, returning the message and the
    /// number of bytes it occupied.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize), ProtocolError> {
        Self::decode_with_limit(bytes, offset, WIRE_PAYLOAD_LIMIT)
    }

    /// Like [`Message::decode`] with a caller-chosen payload bound
    pub fn decode_with_limit(
        bytes: &[u8],
        offset: usize,
        max_payload: usize,
    ) -> Result<(Self, usize), ProtocolError> {
        let buf = bytes.get(offset..).unwrap_or_default();
        let header = FrameHeader::parse(buf, max_payload)?.ok_or(ProtocolError::Truncated {
            needed: CHECKSUM_START + 1,
            available: buf.len(),
        })?;

        let frame_len = header.frame_len();
        if buf.len() < frame_len {
            return Err(ProtocolError::Truncated {
                needed: frame_len,
                available: buf.len(),
            });
        }

        let header_size = header.version.header_size();
        let received = buf[frame_len - 1];
        let expected = header
            .version
            .checksum(&buf[CHECKSUM_START..frame_len - 1]);
        if received != expected {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: received,
            });
        }

        let msg = Self {
            version: header.version,
            direction: header.direction,
            flags: header.flags,
            function: header.function,
            payload: buf[header_size..header_size + header.payload_len].to_vec(),
            checksum: received,
        };
        Ok((msg, frame_len))
    }

    /// View the payload as a typed record.
    ///
    /// `PayloadFit::Exact` requires the payload to be exactly the record
    /// size, `PayloadFit::Prefix` only that it is at least that long.
    pub fn payload_as<T: PayloadRecord>(&self, fit: PayloadFit) -> Result<T, ProtocolError> {
        let fits = match fit {
            PayloadFit::Exact => self.payload.len() == T::SIZE,
            PayloadFit::Prefix => self.payload.len() >= T::SIZE,
        };
        if !fits {
            return Err(ProtocolError::PayloadSizeMismatch {
                expected: T::SIZE,
                actual: self.payload.len(),
            });
        }
        Ok(T::from_le_bytes(&self.payload[..T::SIZE]))
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut header = vec![FRAME_MARKER, self.version.format_byte(), self.direction.as_byte()];
        match self.version {
            WireVersion::V1 => {
                header.push(self.payload.len() as u8);
                header.push(self.function.0 as u8);
            }
            WireVersion::V2 => {
                let mut word = [0u8; 2];
                header.push(self.flags);
                LittleEndian::write_u16(&mut word, self.function.0);
                header.extend_from_slice(&word);
                LittleEndian::write_u16(&mut word, self.payload.len() as u16);
                header.extend_from_slice(&word);
            }
        }
        header
    }

    fn recompute(&mut self) {
        let header = self.header_bytes();
        let parts = [&header[CHECKSUM_START..], self.payload.as_slice()];
        self.checksum = match self.version {
            WireVersion::V1 => v1_checksum_parts(&parts),
            WireVersion::V2 => v2_checksum_parts(&parts),
        };
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(Function::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::records::ApiVersion;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_v2_layout() {
        let msg = Message::new(Function::MSP_API_VERSION);
        let encoded = msg.encode().expect("v2 request should encode");
        assert_eq!(encoded, vec![b'$', b'X', b'<', 0, 1, 0, 0, 0, 0x45]);
    }

    #[test]
    fn test_encode_v1_layout() {
        let mut msg = Message::with_version(WireVersion::V1, Function::MSP_STATUS);
        msg.set_payload(&[0x10, 0x20]).unwrap();
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[..5], [b'$', b'M', b'<', 2, 101]);
        assert_eq!(encoded[5..7], [0x10, 0x20]);
        assert_eq!(encoded[7], 2 ^ 101 ^ 0x10 ^ 0x20);
    }

    #[test]
    fn test_roundtrip_both_versions() {
        for version in [WireVersion::V1, WireVersion::V2] {
            let mut msg = Message::with_version(version, Function::MSP_RC);
            msg.set_direction(Direction::Response);
            msg.set_payload(&[1, 2, 3, 4, 5]).unwrap();
            let encoded = msg.encode().unwrap();
            let (decoded, used) = Message::decode(&encoded, 0).expect("should decode");
            assert_eq!(decoded, msg);
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn test_decode_at_offset() {
        let msg = Message::request(Function::MSP_ATTITUDE, &[9, 9]).unwrap();
        let mut bytes = vec![0xAA, 0xBB];
        bytes.extend(msg.encode().unwrap());
        let (decoded, used) = Message::decode(&bytes, 2).unwrap();
        assert_eq!(decoded.function(), Function::MSP_ATTITUDE);
        assert_eq!(used, bytes.len() - 2);
    }

    #[test]
    fn test_checksum_tracks_setters() {
        let mut msg = Message::new(Function::MSP_STATUS);
        let before = msg.checksum();
        msg.set_function(Function::MSP_RC);
        assert_ne!(before, msg.checksum());

        let encoded = msg.encode().unwrap();
        assert_eq!(*encoded.last().unwrap(), msg.checksum());
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let msg = Message::request(Function::MSP_STATUS, &[1, 2, 3, 4]).unwrap();
        let mut encoded = msg.encode().unwrap();
        encoded[9] ^= 0x01;
        assert!(matches!(
            Message::decode(&encoded, 0),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let msg = Message::request(Function::MSP_STATUS, &[1, 2, 3, 4]).unwrap();
        let encoded = msg.encode().unwrap();
        assert!(matches!(
            Message::decode(&encoded[..encoded.len() - 1], 0),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_v1_rejects_wide_function() {
        let msg = Message::with_version(WireVersion::V1, Function(0x1001));
        assert!(matches!(msg.encode(), Err(ProtocolError::Unencodable { .. })));
    }

    #[test]
    fn test_header_parse_incomplete() {
        assert_eq!(FrameHeader::parse(b"$X", 4096).unwrap(), None);
        assert_eq!(FrameHeader::parse(b"$X>\0\x01\0", 4096).unwrap(), None);
    }

    #[test]
    fn test_header_parse_rejects_oversize() {
        let frame = [b'$', b'X', b'>', 0, 1, 0, 0x00, 0x20];
        assert!(matches!(
            FrameHeader::parse(&frame, 4096),
            Err(ProtocolError::PayloadTooLarge { size: 0x2000, .. })
        ));
    }

    #[test]
    fn test_payload_view_modes() {
        let mut msg = Message::new(Function::MSP_API_VERSION);
        msg.set_payload(&[0, 2, 5, 0xFF]).unwrap();

        assert!(msg.payload_as::<ApiVersion>(PayloadFit::Exact).is_err());
        let api = msg.payload_as::<ApiVersion>(PayloadFit::Prefix).unwrap();
        assert_eq!((api.major, api.minor), (2, 5));

        msg.set_payload(&[0, 2]).unwrap();
        assert!(msg.payload_as::<ApiVersion>(PayloadFit::Prefix).is_err());
    }
}
