//! Control module - the channel-0 protocol.
//!
//! Provides:
//! - [`ControlMessage`] / [`ControlFlag`] - the JSON envelope
//! - [`ControlChannel`] - peer-driven commands plus correlated local RPC
//! - [`CommandContext`] - send-back delegate for command handlers
//! - [`TokenGenerator`] - correlation token scheme
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use serde_json::json;
//!
//! // Answer a custom command on one peer...
//! manager.control().on_command_received(|msg, ctx| {
//!     if msg.command == "run-shell" {
//!         ctx.chunk(json!("partial output")).ok();
//!         ctx.reply(Some(json!("done"))).ok();
//!     }
//! });
//!
//! // ...and stream its replies on the other.
//! let mut call = peer.control().call_remote_streaming("run-shell", None)?;
//! while let Some(reply) = call.next(Duration::from_secs(5)).await? {
//!     println!("{:?}", reply.data);
//! }
//! ```

mod controller;
mod message;
mod token;

pub use controller::{CommandContext, ControlChannel, HandlerId, RemoteCall};
pub use message::{commands, ControlFlag, ControlMessage};
pub use token::TokenGenerator;
