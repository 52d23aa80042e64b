//! Frame assembly and parsing.
//!
//! A frame is the unit exchanged after reframing: a 32-byte metadata header
//! followed by the payload, byte-stuffed as a whole before it is wrapped in
//! frame delimiters on the wire.
//!
//! Header layout (little-endian `u64` fields):
//!
//! ```text
//! ┌────────────┬────────────────┬──────────┬──────────┐
//! │ channel id │ payload length │ frame id │ crc32    │
//! │ 8 bytes    │ 8 bytes        │ 8 bytes  │ 8 bytes  │
//! └────────────┴────────────────┴──────────┴──────────┘
//! ```
//!
//! The CRC32 (IEEE, reflected) is computed over the unescaped payload only,
//! never over the header.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use super::escape::{escape, unescape};
use crate::error::{Result, SerialMuxError};

/// Header size in bytes (fixed, exactly 32).
pub const HEADER_SIZE: usize = 32;

/// Maximum payload bytes per frame when slicing outbound data.
pub const MAX_TRANSMISSION_UNIT: usize = 1000;

/// Channel id reserved for control messages.
pub const CONTROL_CHANNEL_ID: u64 = 0;

/// Process-wide monotonic frame counter; purely diagnostic ordering.
static FRAME_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_frame_id() -> u64 {
    FRAME_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A decoded protocol frame.
///
/// `payload` uses `bytes::Bytes` so delivery to a channel's read queue is
/// a cheap refcount bump, not a copy.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Channel this frame belongs to (`0` = control).
    pub channel_id: u64,
    /// Monotonic sequence number, informational only.
    pub frame_id: u64,
    /// CRC32 of the payload as carried in the header.
    pub crc32: u32,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Build a data frame for `channel_id`.
    ///
    /// Zero-length payloads signal end-of-stream and carry `frame_id = 0`
    /// and `crc32 = 0`.
    pub fn data(payload: impl Into<Bytes>, channel_id: u64) -> Self {
        let payload = payload.into();
        let (frame_id, crc32) = if payload.is_empty() {
            (0, 0)
        } else {
            (next_frame_id(), crc32fast::hash(&payload))
        };

        Self {
            channel_id,
            frame_id,
            crc32,
            payload,
        }
    }

    /// Build the zero-length end-of-stream frame for `channel_id`.
    pub fn end_of_stream(channel_id: u64) -> Self {
        Self::data(Bytes::new(), channel_id)
    }

    /// Build a control frame (channel 0) from a serialized control message.
    pub fn control(message: &str) -> Self {
        Self::data(Bytes::copy_from_slice(message.as_bytes()), CONTROL_CHANNEL_ID)
    }

    /// Split outbound data into MTU-sized frames for one channel.
    ///
    /// Returns an empty vector for empty input; end-of-stream is signaled
    /// explicitly via [`Frame::end_of_stream`], never by slicing.
    pub fn slice(data: &[u8], channel_id: u64) -> Vec<Self> {
        data.chunks(MAX_TRANSMISSION_UNIT)
            .map(|chunk| Self::data(Bytes::copy_from_slice(chunk), channel_id))
            .collect()
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Check whether this frame signals end-of-stream for a data channel.
    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty() && self.channel_id != CONTROL_CHANNEL_ID
    }

    /// Check whether this frame belongs to the control channel.
    #[inline]
    pub fn is_control(&self) -> bool {
        self.channel_id == CONTROL_CHANNEL_ID
    }

    /// Encode header + payload and escape the whole buffer.
    ///
    /// The result is the frame body as it travels between the begin/end
    /// delimiters; the transport adds the delimiters when writing.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.frame_id.to_le_bytes());
        buf.extend_from_slice(&u64::from(self.crc32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        escape(&buf)
    }

    /// Unescape and parse a raw frame body extracted by the scanner.
    ///
    /// Verifies the payload CRC; a mismatch is
    /// [`SerialMuxError::CrcMismatch`], which callers drop and count;
    /// there is no retransmission layer to ask for a resend.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let decoded = unescape(raw);

        if decoded.len() < HEADER_SIZE {
            return Err(SerialMuxError::Protocol(format!(
                "frame shorter than header: {} bytes",
                decoded.len()
            )));
        }

        let channel_id = read_u64_le(&decoded, 0);
        let payload_length = read_u64_le(&decoded, 8);
        let frame_id = read_u64_le(&decoded, 16);
        let crc_field = read_u64_le(&decoded, 24);

        let payload_length = usize::try_from(payload_length).map_err(|_| {
            SerialMuxError::Protocol(format!("payload length {} out of range", payload_length))
        })?;

        if decoded.len() < HEADER_SIZE + payload_length {
            return Err(SerialMuxError::Protocol(format!(
                "truncated payload: header claims {} bytes, {} available",
                payload_length,
                decoded.len() - HEADER_SIZE
            )));
        }

        let expected = u32::try_from(crc_field).map_err(|_| {
            SerialMuxError::Protocol(format!("crc32 field {} out of range", crc_field))
        })?;

        let payload = Bytes::copy_from_slice(&decoded[HEADER_SIZE..HEADER_SIZE + payload_length]);

        let actual = if payload.is_empty() {
            0
        } else {
            crc32fast::hash(&payload)
        };

        if actual != expected {
            return Err(SerialMuxError::CrcMismatch { expected, actual });
        }

        Ok(Self {
            channel_id,
            frame_id,
            crc32: expected,
            payload,
        })
    }
}

#[inline]
fn read_u64_le(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
