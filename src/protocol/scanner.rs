//! Frame boundary scanner for the inbound byte stream.
//!
//! The link delivers an arbitrary dribble of bytes; the scanner buffers
//! partial tails and carves out the escaped frame bodies sitting between a
//! [`FRAME_BEGIN`] and the next [`FRAME_END`] marker. Candidates shorter
//! than the fixed header are corrupt; scanning then resumes one byte past
//! the begin marker so a marker byte inside the damaged region can still
//! open the next frame.
//!
//! # Example
//!
//! ```
//! use serialmux::protocol::{Frame, FrameScanner};
//! use serialmux::protocol::escape::{FRAME_BEGIN, FRAME_END};
//!
//! let frame = Frame::data(&b"hello"[..], 7);
//! let mut wire = vec![FRAME_BEGIN];
//! wire.extend_from_slice(&frame.encode());
//! wire.push(FRAME_END);
//!
//! let mut scanner = FrameScanner::new();
//! let bodies = scanner.push(&wire);
//! assert_eq!(bodies.len(), 1);
//! assert_eq!(Frame::parse(&bodies[0]).unwrap().channel_id, 7);
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::escape::{FRAME_BEGIN, FRAME_END};
use super::frame::HEADER_SIZE;

/// Smallest escaped body that can hold a header; escaping never shrinks
/// a buffer, so anything shorter is corrupt.
const MIN_BODY_SIZE: usize = HEADER_SIZE;

/// Stateful scanner that reassembles frame bodies from stream reads.
///
/// Feed it whatever the link hands over (single bytes, half frames,
/// several frames at once); it yields each complete body exactly once.
pub struct FrameScanner {
    buffer: BytesMut,
    dropped: u64,
}

impl FrameScanner {
    /// Create an empty scanner.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            dropped: 0,
        }
    }

    /// Push freshly read bytes, returning all completed frame bodies.
    ///
    /// Returned buffers are still escaped; hand them to
    /// [`Frame::parse`](super::Frame::parse).
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut bodies = Vec::new();

        loop {
            let Some(beg) = find_byte(&self.buffer, FRAME_BEGIN) else {
                // No begin marker anywhere: these bytes can never start a
                // frame, so they are line noise between frames.
                self.buffer.clear();
                break;
            };

            let Some(end_offset) = find_byte(&self.buffer[beg + 1..], FRAME_END) else {
                // Incomplete tail; drop the noise before the marker and
                // wait for more bytes.
                self.buffer.advance(beg);
                break;
            };

            let body_len = end_offset;

            if body_len < MIN_BODY_SIZE {
                tracing::debug!(
                    "dropping undersized frame candidate: {} bytes",
                    body_len
                );
                self.dropped += 1;
                self.buffer.advance(beg + 1);
                continue;
            }

            let mut chunk = self.buffer.split_to(beg + 1 + body_len + 1);
            chunk.advance(beg + 1);
            chunk.truncate(body_len);
            bodies.push(chunk.freeze());
        }

        bodies
    }

    /// Total candidates dropped as undersized since construction.
    #[inline]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Bytes currently buffered waiting for a frame end.
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn find_byte(buf: &[u8], marker: u8) -> Option<usize> {
    buf.iter().position(|&b| b == marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;

    fn wire_bytes(frame: &Frame) -> Vec<u8> {
        let mut wire = vec![FRAME_BEGIN];
        wire.extend_from_slice(&frame.encode());
        wire.push(FRAME_END);
        wire
    }

    #[test]
    fn test_single_complete_frame() {
        let mut scanner = FrameScanner::new();
        let frame = Frame::data(&b"hello"[..], 1);

        let bodies = scanner.push(&wire_bytes(&frame));

        assert_eq!(bodies.len(), 1);
        let parsed = Frame::parse(&bodies[0]).unwrap();
        assert_eq!(parsed.channel_id, 1);
        assert_eq!(&parsed.payload[..], b"hello");
        assert_eq!(scanner.pending_bytes(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut scanner = FrameScanner::new();

        let mut wire = Vec::new();
        for cid in 1..=3u64 {
            wire.extend(wire_bytes(&Frame::data(&b"x"[..], cid)));
        }

        let bodies = scanner.push(&wire);
        assert_eq!(bodies.len(), 3);

        for (i, body) in bodies.iter().enumerate() {
            assert_eq!(Frame::parse(body).unwrap().channel_id, i as u64 + 1);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut scanner = FrameScanner::new();
        let wire = wire_bytes(&Frame::data(&b"dribble"[..], 5));

        let mut bodies = Vec::new();
        for byte in wire {
            bodies.extend(scanner.push(&[byte]));
        }

        assert_eq!(bodies.len(), 1);
        assert_eq!(&Frame::parse(&bodies[0]).unwrap().payload[..], b"dribble");
    }

    #[test]
    fn test_split_across_pushes() {
        let mut scanner = FrameScanner::new();
        let wire = wire_bytes(&Frame::data(vec![0xAA; 300], 2));

        let bodies = scanner.push(&wire[..wire.len() / 2]);
        assert!(bodies.is_empty());
        assert!(scanner.pending_bytes() > 0);

        let bodies = scanner.push(&wire[wire.len() / 2..]);
        assert_eq!(bodies.len(), 1);
        assert_eq!(Frame::parse(&bodies[0]).unwrap().payload_len(), 300);
    }

    #[test]
    fn test_noise_before_frame_is_ignored() {
        let mut scanner = FrameScanner::new();
        let mut wire = vec![0xFF, 0xFE, 0x42];
        wire.extend(wire_bytes(&Frame::data(&b"ok"[..], 1)));

        let bodies = scanner.push(&wire);
        assert_eq!(bodies.len(), 1);
        assert_eq!(&Frame::parse(&bodies[0]).unwrap().payload[..], b"ok");
    }

    #[test]
    fn test_pure_noise_is_discarded() {
        let mut scanner = FrameScanner::new();
        let bodies = scanner.push(&[0xFF; 64]);
        assert!(bodies.is_empty());
        assert_eq!(scanner.pending_bytes(), 0);
    }

    #[test]
    fn test_undersized_frame_dropped_then_resync() {
        let mut scanner = FrameScanner::new();

        // A begin marker followed almost immediately by an end marker:
        // far below the minimum header size.
        let mut wire = vec![FRAME_BEGIN, 0x41, 0x42, FRAME_END];
        wire.extend(wire_bytes(&Frame::data(&b"valid"[..], 7)));

        let bodies = scanner.push(&wire);

        assert_eq!(bodies.len(), 1);
        assert_eq!(scanner.dropped_frames(), 1);
        let parsed = Frame::parse(&bodies[0]).unwrap();
        assert_eq!(parsed.channel_id, 7);
        assert_eq!(&parsed.payload[..], b"valid");
    }

    #[test]
    fn test_drop_counter_accumulates() {
        let mut scanner = FrameScanner::new();
        for _ in 0..4 {
            scanner.push(&[FRAME_BEGIN, FRAME_END]);
        }
        assert_eq!(scanner.dropped_frames(), 4);
    }
}
