//! Error types for serialmux.

use thiserror::Error;

/// Main error type for all serialmux operations.
#[derive(Debug, Error)]
pub enum SerialMuxError {
    /// I/O error on the underlying link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (control plane only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed frame, reserved id misuse, bad reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame payload failed its CRC32 check.
    #[error("CRC mismatch: header {expected:#010x}, payload {actual:#010x}")]
    CrcMismatch {
        /// CRC32 carried in the frame header.
        expected: u32,
        /// CRC32 recomputed over the received payload.
        actual: u32,
    },

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Write or finish on a channel that is finished or destroyed.
    #[error("Channel {0} is closed")]
    ChannelClosed(u64),

    /// No matching control callback arrived within the deadline.
    #[error("Remote call timed out")]
    RpcTimeout,

    /// The underlying link closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using SerialMuxError.
pub type Result<T> = std::result::Result<T, SerialMuxError>;
