//! Typed payload records
//!
//! All multi-byte fields are little-endian on the wire.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// How strictly a payload must match a record's size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFit {
    /// Payload length must equal the record size
    Exact,
    /// Payload may carry trailing bytes after the record
    Prefix,
}

/// A fixed-size record that can be read out of a message payload
pub trait PayloadRecord: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decode from exactly `SIZE` bytes
    fn from_le_bytes(bytes: &[u8]) -> Self;
}

/// Reply to `MSP_API_VERSION`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiVersion {
    /// MSP protocol revision
    pub protocol_version: u8,
    /// API major version
    pub major: u8,
    /// API minor version
    pub minor: u8,
}

impl PayloadRecord for ApiVersion {
    const SIZE: usize = 3;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        Self {
            protocol_version: bytes[0],
            major: bytes[1],
            minor: bytes[2],
        }
    }
}

/// Reply to `MSP_FC_VARIANT`: a four character firmware tag such as `INAV`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FcVariant(pub [u8; 4]);

impl FcVariant {
    /// Tag as text, lossily decoded
    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// Byte-exact comparison with `tag`
    pub fn matches(&self, tag: &str) -> bool {
        self.0.as_slice() == tag.as_bytes()
    }
}

impl PayloadRecord for FcVariant {
    const SIZE: usize = 4;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&bytes[..4]);
        Self(tag)
    }
}

/// Fixed part of the reply to `MSP_BOARD_INFO`.
///
/// The firmware appends the target name after these fields, so this record
/// is read in [`PayloadFit::Prefix`] mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoardInfo {
    /// Four character board id, e.g. `MK4X`
    pub board_ident: [u8; 4],
    /// Board hardware revision
    pub hardware_revision: u16,
    /// OSD support flags
    pub osd_support: u8,
    /// Communication capability flags
    pub comm_capabilities: u8,
    /// Length of the target name that follows
    pub target_name_length: u8,
}

impl BoardInfo {
    /// Board id as text
    pub fn ident(&self) -> String {
        String::from_utf8_lossy(&self.board_ident).into_owned()
    }

    /// Target name following the fixed fields, clipped to what was received
    pub fn target_name(&self, payload: &[u8]) -> String {
        let start = Self::SIZE.min(payload.len());
        let end = (start + self.target_name_length as usize).min(payload.len());
        String::from_utf8_lossy(&payload[start..end]).into_owned()
    }
}

impl PayloadRecord for BoardInfo {
    const SIZE: usize = 9;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut board_ident = [0u8; 4];
        board_ident.copy_from_slice(&bytes[..4]);
        Self {
            board_ident,
            hardware_revision: LittleEndian::read_u16(&bytes[4..6]),
            osd_support: bytes[6],
            comm_capabilities: bytes[7],
            target_name_length: bytes[8],
        }
    }
}

/// Number of RC channels carried by `MSP_SET_RAW_RC`
pub const RC_CHANNEL_COUNT: usize = 8;

/// RC channel values in microseconds (1000..=2000 nominal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcChannels(pub [u16; RC_CHANNEL_COUNT]);

impl RcChannels {
    /// Mid-stick value for every channel
    pub const CENTER: u16 = 1500;

    /// Every channel at mid stick
    pub fn centered() -> Self {
        Self([Self::CENTER; RC_CHANNEL_COUNT])
    }

    /// Set one channel, ignoring out-of-range indices
    pub fn set(&mut self, channel: usize, value: u16) -> bool {
        match self.0.get_mut(channel) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Encode as an `MSP_SET_RAW_RC` payload
    pub fn to_payload(&self) -> Vec<u8> {
        self.0
            .iter()
            .fold(PayloadBuilder::new(), |b, &v| b.u16_le(v))
            .build()
    }
}

impl Default for RcChannels {
    fn default() -> Self {
        Self::centered()
    }
}

impl PayloadRecord for RcChannels {
    const SIZE: usize = RC_CHANNEL_COUNT * 2;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut channels = [0u16; RC_CHANNEL_COUNT];
        LittleEndian::read_u16_into(&bytes[..Self::SIZE], &mut channels);
        Self(channels)
    }
}

/// Builder for little-endian payloads
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    payload: Vec<u8>,
}

impl PayloadBuilder {
    /// Empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (little-endian)
    pub fn u16_le(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Finished payload bytes
    pub fn build(self) -> Vec<u8> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_board_info_decode() {
        let payload = PayloadBuilder::new()
            .bytes(b"SPF4")
            .u16_le(0x0102)
            .byte(1)
            .byte(0x03)
            .byte(6)
            .bytes(b"SPRF4X")
            .build();
        let info = BoardInfo::from_le_bytes(&payload[..BoardInfo::SIZE]);
        assert_eq!(info.ident(), "SPF4");
        assert_eq!(info.hardware_revision, 0x0102);
        assert_eq!(info.target_name(&payload), "SPRF4X");
    }

    #[test]
    fn test_target_name_clipped() {
        let info = BoardInfo {
            target_name_length: 10,
            ..BoardInfo::default()
        };
        let mut payload = vec![0u8; BoardInfo::SIZE];
        payload.extend_from_slice(b"ABC");
        assert_eq!(info.target_name(&payload), "ABC");
    }

    #[test]
    fn test_rc_channels_payload() {
        let mut rc = RcChannels::centered();
        assert!(rc.set(0, 1000));
        assert!(!rc.set(RC_CHANNEL_COUNT, 1000));

        let payload = rc.to_payload();
        assert_eq!(payload.len(), RcChannels::SIZE);
        assert_eq!(payload[..4], [0xE8, 0x03, 0xDC, 0x05]);
        assert_eq!(RcChannels::from_le_bytes(&payload), rc);
    }

    #[test]
    fn test_variant_match() {
        let variant = FcVariant(*b"INAV");
        assert!(variant.matches("INAV"));
        assert!(!variant.matches("BTFL"));
        assert_eq!(variant.as_str(), "INAV");
    }
}
