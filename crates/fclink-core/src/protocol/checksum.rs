//! Frame checksums
//!
//! MSP v1 frames carry an XOR of the size, function and payload bytes.
//! MSP v2 frames carry a CRC-8 (DVB-S2, polynomial 0xD5) of the flags,
//! function, size and payload bytes.

use crc::{Crc, CRC_8_DVB_S2};

/// CRC-8/DVB-S2 as used by MSP v2
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_DVB_S2);

/// Checksum used by MSP v1 frames
pub fn v1_checksum(data: &[u8]) -> u8 {
    v1_checksum_parts(&[data])
}

/// XOR checksum over several byte ranges, as if they were contiguous
pub fn v1_checksum_parts(parts: &[&[u8]]) -> u8 {
    parts
        .iter()
        .flat_map(|part| part.iter())
        .fold(0, |crc, &b| crc ^ b)
}

/// Checksum used by MSP v2 frames
pub fn v2_checksum(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// DVB-S2 CRC over several byte ranges, as if they were contiguous
pub fn v2_checksum_parts(parts: &[&[u8]]) -> u8 {
    let mut digest = CRC8.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}
