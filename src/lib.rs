//! # serialmux
//!
//! Multiplexes one physical byte-stream link (typically a serial cable,
//! optionally several in parallel) into many independent, ordered,
//! bidirectional virtual channels, plus a reserved control channel for
//! negotiating channels and carrying small RPC-style control messages.
//!
//! ## Architecture
//!
//! - **Protocol** (`protocol`): byte-stuffing, 32-byte frame header with
//!   payload CRC32, and a boundary scanner that reassembles frames from a
//!   fragmented byte stream.
//! - **Transport** (`transport`): one duplex endpoint per
//!   [`PhysicalPort`], with prioritized outgoing and inbound frame queues
//!   drained by dedicated tasks.
//! - **Channels** (`channel`): [`Channel`] is a duplex stream pinned to
//!   one transport; [`ChannelManager`] owns the id space and routes
//!   inbound frames.
//! - **Control** (`control`): the channel-0 protocol: `ESTABLISH` /
//!   `DISPOSE`, application-defined commands, and token-correlated RPC
//!   with keep-alive multi-reply streaming.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use serialmux::{ChannelManager, PeerRole};
//! use serialmux::transport::open_serial_port;
//!
//! #[tokio::main]
//! async fn main() -> serialmux::Result<()> {
//!     let port = open_serial_port("/dev/ttyUSB0", 1_600_000)?;
//!     port.start()?;
//!
//!     let manager = ChannelManager::new(port, "proxy", PeerRole::Initiator);
//!
//!     // Ask the peer for a fresh channel and tunnel bytes through it.
//!     let channel = manager.require_connection(Duration::from_secs(5)).await?;
//!     channel.write(b"hello")?;
//!     channel.finish()?;
//!
//!     while let Some(chunk) = channel.read().await {
//!         println!("got {} bytes", chunk.len());
//!     }
//!
//!     manager.release_connection(&channel, Duration::from_secs(5)).await
//! }
//! ```
//!
//! The protocol detects corruption (CRC32 per frame) but does not correct
//! it; it assumes the link delivers bytes in order without duplication,
//! which holds for a serial line.

pub mod channel;
pub mod control;
pub mod error;
pub mod protocol;
pub mod transport;

pub use channel::{Channel, ChannelManager, PeerRole};
pub use control::{CommandContext, ControlChannel, ControlFlag, ControlMessage, RemoteCall};
pub use error::{Result, SerialMuxError};
pub use protocol::{Frame, FrameScanner};
pub use transport::{PhysicalPort, PortState};
