//! Protocol module - byte-stuffing, frame codec, and boundary scanning.
//!
//! Pure functions and small state machines with no I/O:
//! - escaping/unescaping of the reserved wire alphabet
//! - 32-byte metadata header encode/decode with payload CRC32
//! - reassembly of frame bodies from a fragmented byte stream

pub mod escape;

mod frame;
mod scanner;

pub use escape::{escape, unescape, ESCAPE, FRAME_BEGIN, FRAME_END};
pub use frame::{Frame, CONTROL_CHANNEL_ID, HEADER_SIZE, MAX_TRANSMISSION_UNIT};
pub use scanner::FrameScanner;
