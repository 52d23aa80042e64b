//! Transport module - physical link handling.
//!
//! Provides:
//! - [`PhysicalPort`] - one duplex endpoint plus its framing, queues, and
//!   backpressure bookkeeping
//! - serial device construction behind the `serial` feature

mod port;

#[cfg(feature = "serial")]
mod serial;

pub use port::{FrameListener, ListenerId, PhysicalPort, PortState};

#[cfg(feature = "serial")]
pub use serial::open_serial_port;
