//! Per-line frame extraction
//!
//! Received bytes are appended to the line's ring; `next_frame` then walks
//! the ring looking for a `$` marker, validates the header, waits for the
//! rest of the frame and checks its checksum. Malformed data is dropped and
//! scanning resumes, so a corrupted frame never stalls the line.
//!
//! A read larger than the free ring space is taken in pieces, with frames
//! extracted between pieces.

use serde::Serialize;
use tracing::{debug, warn};

use super::message::{FrameHeader, Message, WireVersion};
use super::ring::RingBuffer;
use super::{ProtocolError, FRAME_MARKER};

/// Where the framer stopped on its last attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    /// No marker in the buffered bytes yet
    SeekingMarker,
    /// Marker at the head, header not fully buffered
    AwaitingHeader,
    /// Header validated, payload or checksum not fully buffered
    AwaitingPayload { frame_len: usize },
}

/// Counters for what the framer has accepted and thrown away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FramerStats {
    /// Frames decoded and handed on
    pub frames: u64,
    /// Bytes dropped while looking for a marker
    pub extraneous_bytes: u64,
    /// Marker followed by an unknown format byte
    pub bad_format: u64,
    /// Unknown direction byte
    pub bad_direction: u64,
    /// Header declared a payload over the limit
    pub oversize: u64,
    /// Complete frames that failed their checksum
    pub checksum_errors: u64,
    /// Reads cut short because the ring was full
    pub overflows: u64,
}

impl FramerStats {
    /// Frames rejected for any reason
    pub fn errors(&self) -> u64 {
        self.bad_format + self.bad_direction + self.oversize + self.checksum_errors
    }
}

/// Frames extracted from one read
#[derive(Debug, Default, PartialEq)]
pub struct Received {
    /// Decoded frames, in arrival order
    pub frames: Vec<Message>,
    /// Tail of the read that found no room in the ring
    pub dropped: usize,
}

/// Result of one framing attempt
enum Attempt {
    Frame(Message),
    NeedMore,
    Rejected,
}

/// Frame extractor owning one line's receive ring
#[derive(Debug)]
pub struct Framer {
    line: usize,
    ring: RingBuffer,
    max_payload: usize,
    state: FramerState,
    stats: FramerStats,
}

impl Framer {
    /// Framer for `line` with a ring of `ring_capacity` bytes
    pub fn new(line: usize, ring_capacity: usize, max_payload: usize) -> Self {
        Self {
            line,
            ring: RingBuffer::new(ring_capacity),
            max_payload,
            state: FramerState::SeekingMarker,
            stats: FramerStats::default(),
        }
    }

    /// Where the last framing attempt stopped
    pub fn state(&self) -> FramerState {
        self.state
    }

    /// Counters since the framer was created
    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Bytes waiting in the ring
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Append received bytes and extract every frame they complete
    ///
    /// The read is pushed in pieces as ring space allows, draining frames
    /// after each piece. When the ring is full, bytes ahead of the first
    /// marker are dropped to make room. Only what still does not fit after
    /// that is dropped and reported in [`Received::dropped`].
    pub fn feed(&mut self, bytes: &[u8]) -> Received {
        let mut received = Received::default();
        let mut rest = bytes;
        while !rest.is_empty() {
            if self.ring.free() == 0 {
                self.compact();
            }
            let taken = self.ring.push(rest);
            if taken == 0 {
                warn!(line = self.line, dropped = rest.len(), "Receive ring overflow");
                self.stats.overflows += 1;
                received.dropped = rest.len();
                break;
            }
            rest = &rest[taken..];
            received.frames.extend(self.drain());
        }
        received
    }

    /// Extract the next complete frame, skipping over anything malformed
    pub fn next_frame(&mut self) -> Option<Message> {
        loop {
            match self.attempt() {
                Attempt::Frame(msg) => return Some(msg),
                Attempt::NeedMore => return None,
                Attempt::Rejected => continue,
            }
        }
    }

    /// Extract every complete frame currently buffered
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    fn attempt(&mut self) -> Attempt {
        let Some(off) = self.ring.position(FRAME_MARKER) else {
            // Keep the bytes; the ring is compacted if it ever fills up
            self.state = FramerState::SeekingMarker;
            return Attempt::NeedMore;
        };
        if off > 0 {
            self.discard_extraneous(off);
        }

        let line = self.line;
        let max_payload = self.max_payload;
        let buf = self.ring.as_contiguous();

        let header = match FrameHeader::parse(buf, max_payload) {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.state = FramerState::AwaitingHeader;
                return Attempt::NeedMore;
            }
            Err(e) => return self.reject_header(e),
        };

        let frame_len = header.frame_len();
        if buf.len() < frame_len {
            self.state = FramerState::AwaitingPayload { frame_len };
            return Attempt::NeedMore;
        }

        match Message::decode_with_limit(buf, 0, max_payload) {
            Ok((msg, used)) => {
                self.ring.rotate(used);
                self.state = FramerState::SeekingMarker;
                self.stats.frames += 1;
                debug!(
                    line,
                    function = %msg.function(),
                    size = msg.payload_size(),
                    "Decoded MSP frame"
                );
                Attempt::Frame(msg)
            }
            Err(ProtocolError::ChecksumMismatch { expected, actual }) => {
                warn!(
                    line,
                    function = %header.function,
                    expected,
                    actual,
                    "MSP packet error: checksum"
                );
                self.ring.rotate(frame_len);
                self.state = FramerState::SeekingMarker;
                self.stats.checksum_errors += 1;
                Attempt::Rejected
            }
            Err(e) => {
                // Header already validated and frame fully buffered
                warn!(line, error = %e, "MSP packet error");
                self.ring.rotate(1);
                self.state = FramerState::SeekingMarker;
                Attempt::Rejected
            }
        }
    }

    fn reject_header(&mut self, error: ProtocolError) -> Attempt {
        let line = self.line;
        let skip = match error {
            ProtocolError::BadFormat(byte) => {
                warn!(line, byte, "MSP packet error: magic");
                self.stats.bad_format += 1;
                2
            }
            ProtocolError::BadDirection(byte) => {
                warn!(line, byte, "MSP packet error: direction");
                self.stats.bad_direction += 1;
                3
            }
            ProtocolError::PayloadTooLarge { size, max } => {
                warn!(line, size, max, "MSP packet error: payload size");
                self.stats.oversize += 1;
                let version = self
                    .ring
                    .peek(1)
                    .and_then(WireVersion::from_format_byte)
                    .unwrap_or_default();
                version.header_size()
            }
            other => {
                warn!(line, error = %other, "MSP packet error");
                1
            }
        };
        self.ring.rotate(skip);
        self.state = FramerState::SeekingMarker;
        Attempt::Rejected
    }

    /// Drop everything ahead of the first marker
    fn compact(&mut self) {
        let junk = self.ring.position(FRAME_MARKER).unwrap_or(self.ring.len());
        if junk > 0 {
            self.discard_extraneous(junk);
        }
    }

    fn discard_extraneous(&mut self, count: usize) {
        warn!(line = self.line, count, "Dumped extraneous bytes");
        self.stats.extraneous_bytes += count as u64;
        self.ring.rotate(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Direction;
    use crate::protocol::Function;
    use pretty_assertions::assert_eq;

    fn response(function: Function, payload: &[u8]) -> Vec<u8> {
        let mut msg = Message::request(function, payload).unwrap();
        msg.set_direction(Direction::Response);
        msg.encode().unwrap()
    }

    fn framer() -> Framer {
        Framer::new(0, 1024, 256)
    }

    #[test]
    fn test_single_frame() {
        let mut f = framer();
        let received = f.feed(&response(Function::MSP_STATUS, &[1, 2, 3]));
        assert_eq!(received.frames.len(), 1);
        assert_eq!(received.dropped, 0);
        let msg = &received.frames[0];
        assert_eq!(msg.function(), Function::MSP_STATUS);
        assert_eq!(msg.payload(), &[1, 2, 3]);
        assert_eq!(f.buffered(), 0);
        assert_eq!(f.next_frame(), None);
    }

    #[test]
    fn test_garbage_prefix_is_discarded() {
        let mut f = framer();
        let mut bytes = vec![0x00, 0x11, 0x22, 0x33, 0x44];
        bytes.extend(response(Function::MSP_RC, &[7]));
        let frames = f.feed(&bytes).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(f.stats().extraneous_bytes, 5);
        assert_eq!(f.stats().errors(), 0);
    }

    #[test]
    fn test_garbage_kept_until_marker_arrives() {
        let mut f = framer();
        assert!(f.feed(&[0xAA, 0xBB, 0xCC]).frames.is_empty());
        assert_eq!(f.state(), FramerState::SeekingMarker);
        assert_eq!(f.buffered(), 3);

        assert_eq!(f.feed(&response(Function::MSP_RC, &[])).frames.len(), 1);
        assert_eq!(f.stats().extraneous_bytes, 3);
    }

    #[test]
    fn test_split_delivery() {
        let mut f = framer();
        let frame = response(Function::MSP_ATTITUDE, &[1, 2, 3, 4, 5, 6]);

        assert!(f.feed(&frame[..2]).frames.is_empty());
        assert_eq!(f.state(), FramerState::AwaitingHeader);

        assert!(f.feed(&frame[2..10]).frames.is_empty());
        assert_eq!(
            f.state(),
            FramerState::AwaitingPayload {
                frame_len: frame.len()
            }
        );

        assert_eq!(f.feed(&frame[10..]).frames.len(), 1);
        assert_eq!(f.state(), FramerState::SeekingMarker);
    }

    #[test]
    fn test_false_marker_skipped() {
        let mut f = framer();
        let mut bytes = b"$Q".to_vec();
        bytes.extend(response(Function::MSP_RC, &[1]));
        assert_eq!(f.feed(&bytes).frames.len(), 1);
        assert_eq!(f.stats().bad_format, 1);
    }

    #[test]
    fn test_bad_direction_skipped() {
        let mut f = framer();
        let mut bytes = b"$X?".to_vec();
        bytes.extend(response(Function::MSP_RC, &[1]));
        assert_eq!(f.feed(&bytes).frames.len(), 1);
        assert_eq!(f.stats().bad_direction, 1);
    }

    #[test]
    fn test_oversize_payload_abandoned() {
        let mut f = framer();
        // Declares 0x0200 bytes against a 256 byte limit
        let mut bytes = vec![b'$', b'X', b'>', 0, 1, 0, 0x00, 0x02];
        bytes.extend(response(Function::MSP_API_VERSION, &[0, 2, 5]));
        let frames = f.feed(&bytes).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function(), Function::MSP_API_VERSION);
        assert_eq!(f.stats().oversize, 1);
    }

    #[test]
    fn test_checksum_error_drops_frame() {
        let mut f = framer();
        let mut bad = response(Function::MSP_STATUS, &[1, 2, 3]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        bad.extend(response(Function::MSP_RC, &[]));
        let frames = f.feed(&bad).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function(), Function::MSP_RC);
        assert_eq!(f.stats().checksum_errors, 1);
    }

    #[test]
    fn test_single_bit_flips_never_reach_caller() {
        let mut original = Message::request(Function::MSP_STATUS, &[0x10, 0x20, 0x30]).unwrap();
        original.set_direction(Direction::Response);
        let frame = original.encode().unwrap();

        // Flags through payload are covered by the checksum
        for index in 3..frame.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                let mut f = framer();
                let decoded = f.feed(&corrupted).frames;

                assert!(
                    !decoded.contains(&original),
                    "flip at byte {} bit {} was accepted",
                    index,
                    bit
                );
                // Size bytes change the frame length, everything else must
                // fail the checksum outright
                if index != 6 && index != 7 {
                    assert!(decoded.is_empty(), "byte {} bit {}", index, bit);
                }
            }
        }
    }

    #[test]
    fn test_mixed_versions_autodetected() {
        let mut f = framer();
        let mut v1 = Message::with_version(WireVersion::V1, Function::MSP_RC);
        v1.set_direction(Direction::Response);
        let mut bytes = v1.encode().unwrap();
        bytes.extend(response(Function::MSP_STATUS, &[]));
        let frames = f.feed(&bytes).frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].version(), WireVersion::V1);
        assert_eq!(frames[1].version(), WireVersion::V2);
    }

    #[test]
    fn test_full_ring_compacts_garbage() {
        let mut f = Framer::new(0, 16, 8);
        assert!(f.feed(&[0u8; 12]).frames.is_empty());
        let received = f.feed(&response(Function::MSP_RC, &[1]));
        assert_eq!(received.frames.len(), 1);
        assert_eq!(received.dropped, 0);
        assert_eq!(f.stats().extraneous_bytes, 12);

        // Garbage alone never overflows; it is dropped as the ring fills
        assert_eq!(f.feed(&[0u8; 40]).dropped, 0);
        assert_eq!(f.stats().overflows, 0);
    }

    #[test]
    fn test_read_larger_than_ring() {
        // 50 byte ring, 64 byte read: one reply followed by padding
        let mut f = Framer::new(0, 50, 16);
        let mut bytes = response(Function::MSP_STATUS, &[1, 2, 3, 4]);
        let frame_len = bytes.len();
        bytes.resize(64, 0);

        let received = f.feed(&bytes);
        assert_eq!(received.frames.len(), 1);
        assert_eq!(received.frames[0].function(), Function::MSP_STATUS);
        assert_eq!(received.dropped, 0);
        assert_eq!(f.stats().extraneous_bytes, (64 - frame_len - f.buffered()) as u64);
    }

    #[test]
    fn test_frames_across_ring_refills() {
        let mut f = Framer::new(0, 32, 16);
        let mut bytes = Vec::new();
        let payloads: [&[u8]; 4] = [&[1], &[2, 2], &[3, 3, 3], &[4; 16]];
        for payload in payloads {
            bytes.extend(response(Function::MSP_RC, payload));
        }

        let received = f.feed(&bytes);
        let sizes: Vec<usize> = received.frames.iter().map(|m| m.payload_size()).collect();
        assert_eq!(sizes, vec![1, 2, 3, 16]);
        assert_eq!(received.dropped, 0);
        assert_eq!(f.stats().extraneous_bytes, 0);
    }

    #[test]
    fn test_overflow_behind_stalled_frame() {
        // A header declaring 8 bytes needs 17, more than the ring holds
        let mut f = Framer::new(0, 16, 8);
        let mut stalled = vec![b'$', b'X', b'>', 0, 1, 0, 8, 0];
        stalled.extend([0u8; 8]);
        assert!(f.feed(&stalled).frames.is_empty());
        assert_eq!(f.state(), FramerState::AwaitingPayload { frame_len: 17 });

        let received = f.feed(&[0u8; 5]);
        assert_eq!(received.dropped, 5);
        assert_eq!(f.stats().overflows, 1);
    }
}
