//! Channel module - virtual streams and their manager.
//!
//! Provides:
//! - [`Channel`] - one bidirectional byte stream bound to a channel id
//! - [`ChannelManager`] - id space, frame routing, transport selection
//! - [`PeerRole`] - which parity of the id space this side allocates from

mod channel;
mod manager;

pub use channel::Channel;
pub use manager::{ChannelManager, PeerRole};
