//! Virtual channel: one bidirectional stream multiplexed over a link.
//!
//! Writes are sliced into frames tagged with the channel id and queued on
//! the transport the channel was pinned to at creation. Inbound payloads
//! arrive from the channel manager in frame order and are buffered until
//! the reader pulls them.
//!
//! The two directions close independently: a locally finished channel can
//! still be read, a remotely ended channel can still be written. The
//! manager may also force destruction at any time to reclaim the id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Result, SerialMuxError};
use crate::protocol::Frame;
use crate::transport::PhysicalPort;

/// A bidirectional byte stream bound to one channel id and one transport.
pub struct Channel {
    cid: u64,
    port: Arc<PhysicalPort>,

    /// Delivery side of the inbound queue; dropped on destroy.
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Option<Bytes>>>>,
    /// Reader side of the inbound queue.
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<Bytes>>>,

    finished: AtomicBool,
    remote_ended: AtomicBool,
    destroyed: AtomicBool,
}

impl Channel {
    /// Create a channel pinned to `port`. Called by the channel manager.
    pub(crate) fn new(cid: u64, port: Arc<PhysicalPort>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            cid,
            port,
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            finished: AtomicBool::new(false),
            remote_ended: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Channel id, unique across all transports bound to one manager.
    #[inline]
    pub fn cid(&self) -> u64 {
        self.cid
    }

    /// Whether the local write side has ended.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether the peer has signaled end-of-stream.
    #[inline]
    pub fn is_remote_ended(&self) -> bool {
        self.remote_ended.load(Ordering::Acquire)
    }

    /// Whether the channel has been destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Slice `data` into frames and queue them on the pinned transport.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_destroyed() || self.is_finished() {
            return Err(SerialMuxError::ChannelClosed(self.cid));
        }

        self.port.enqueue_out(Frame::slice(data, self.cid))
    }

    /// End the write side: queue a single zero-length frame so the peer
    /// sees end-of-stream. Reading may continue. Idempotent.
    pub fn finish(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(SerialMuxError::ChannelClosed(self.cid));
        }

        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.port.enqueue_out(vec![Frame::end_of_stream(self.cid)])
    }

    /// Pull the next inbound payload in arrival order.
    ///
    /// Returns `None` once the peer has ended the stream or the channel
    /// was destroyed.
    pub async fn read(&self) -> Option<Bytes> {
        if self.is_destroyed() {
            return None;
        }

        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(Some(payload)) => Some(payload),
            Some(None) | None => {
                self.remote_ended.store(true, Ordering::Release);
                rx.close();
                None
            }
        }
    }

    /// Feed an inbound payload from the manager; `None` marks remote
    /// end-of-stream. Deliveries after destruction are silently dropped.
    pub(crate) fn deliver(&self, payload: Option<Bytes>) {
        if self.is_destroyed() {
            return;
        }

        if payload.is_none() {
            self.remote_ended.store(true, Ordering::Release);
        }

        if let Some(tx) = &*self.inbound_tx.lock().unwrap() {
            let _ = tx.send(payload);
        }
    }

    /// Release buffers and mark the channel unusable.
    /// Double-destroy is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the sender wakes any pending read with end-of-queue.
        *self.inbound_tx.lock().unwrap() = None;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("cid", &self.cid)
            .field("finished", &self.is_finished())
            .field("remote_ended", &self.is_remote_ended())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn test_port() -> Arc<PhysicalPort> {
        let (a, b) = duplex(64 * 1024);
        // Leak the peer end so the link stays open for the test's lifetime.
        std::mem::forget(b);
        let port = PhysicalPort::new(a);
        port.start().unwrap();
        port
    }

    #[tokio::test]
    async fn test_reads_preserve_arrival_order() {
        let channel = Channel::new(5, test_port());

        channel.deliver(Some(Bytes::from_static(b"one")));
        channel.deliver(Some(Bytes::from_static(b"two")));
        channel.deliver(Some(Bytes::from_static(b"three")));

        assert_eq!(channel.read().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(channel.read().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(channel.read().await.unwrap(), Bytes::from_static(b"three"));
    }

    #[tokio::test]
    async fn test_null_delivery_marks_remote_end() {
        let channel = Channel::new(5, test_port());

        channel.deliver(Some(Bytes::from_static(b"last")));
        channel.deliver(None);

        assert_eq!(channel.read().await.unwrap(), Bytes::from_static(b"last"));
        assert!(channel.read().await.is_none());
        assert!(channel.is_remote_ended());

        // Subsequent reads keep returning end-of-stream.
        assert!(channel.read().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_end_does_not_close_write_side() {
        let channel = Channel::new(5, test_port());

        channel.deliver(None);
        assert!(channel.read().await.is_none());

        assert!(channel.write(b"still writable").is_ok());
        assert!(channel.finish().is_ok());
    }

    #[tokio::test]
    async fn test_write_after_finish_fails() {
        let channel = Channel::new(5, test_port());

        channel.finish().unwrap();
        assert!(matches!(
            channel.write(b"late"),
            Err(SerialMuxError::ChannelClosed(5))
        ));

        // Finishing again is a no-op, not an error.
        assert!(channel.finish().is_ok());
    }

    #[tokio::test]
    async fn test_finished_channel_still_reads() {
        let channel = Channel::new(5, test_port());

        channel.finish().unwrap();
        channel.deliver(Some(Bytes::from_static(b"incoming")));

        assert_eq!(
            channel.read().await.unwrap(),
            Bytes::from_static(b"incoming")
        );
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_closes_reads() {
        let channel = Channel::new(5, test_port());

        channel.destroy();
        channel.destroy();

        assert!(channel.is_destroyed());
        assert!(channel.read().await.is_none());
        assert!(matches!(
            channel.write(b"dead"),
            Err(SerialMuxError::ChannelClosed(5))
        ));
    }

    #[tokio::test]
    async fn test_deliver_after_destroy_is_dropped() {
        let channel = Channel::new(5, test_port());

        channel.destroy();
        channel.deliver(Some(Bytes::from_static(b"ghost")));
        assert!(channel.read().await.is_none());
    }

    #[tokio::test]
    async fn test_write_enqueues_on_transport() {
        // Tiny pipe buffer with an unread peer: the write task blocks on
        // the first frame, so the rest stay visible in the queue.
        let (a, b) = duplex(16);
        std::mem::forget(b);
        let port = PhysicalPort::new(a);
        port.start().unwrap();

        let channel = Channel::new(9, port.clone());

        channel.write(&[0xAB; 2500]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // 2500 bytes slice into 3 frames; at most one is in flight.
        assert!(port.back_pressure() >= 2);
    }
}
