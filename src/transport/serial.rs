//! Serial-link endpoint construction (feature `serial`).
//!
//! The multiplexing core is agnostic to the endpoint type; this module is
//! the convenience path that opens a real serial device and wraps it in a
//! [`PhysicalPort`].

use std::sync::Arc;

use tokio_serial::SerialPortBuilderExt;

use super::PhysicalPort;
use crate::error::Result;

/// Open a serial device and wrap it as a [`PhysicalPort`].
///
/// The port still has to be [`start`](PhysicalPort::start)ed.
pub fn open_serial_port(path: &str, baud_rate: u32) -> Result<Arc<PhysicalPort>> {
    let stream = tokio_serial::new(path, baud_rate)
        .open_native_async()
        .map_err(std::io::Error::from)?;

    tracing::debug!("Serial port opened: {} @ {}", path, baud_rate);
    Ok(PhysicalPort::new(stream))
}
