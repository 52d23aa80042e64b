//! Physical transport over one duplex byte-stream link.
//!
//! A [`PhysicalPort`] owns exactly one open endpoint and runs three tasks
//! once started:
//!
//! ```text
//! enqueue_out ──► outgoing deque ──► write task ──► link
//! publish_control ─┘ (front)
//!
//! link ──► read task ──► scanner/parser ──► inbound queue ──► dispatch task ──► listeners
//! ```
//!
//! Control frames jump to the front of the outgoing deque so channel
//! teardown and RPC traffic are never starved behind bulk data. The write
//! task moves one frame per iteration and flushes after each, which paces
//! output to the link's own flow control.
//!
//! An unexpected close of the endpoint is fatal for the port: it is logged,
//! the port drains and stops itself, and [`PhysicalPort::wait_for_shutdown`]
//! surfaces the failure to the caller. There is no reconnect path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, SerialMuxError};
use crate::protocol::{Frame, FrameScanner, FRAME_BEGIN, FRAME_END};

/// Read buffer size for the inbound drain task.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Lifecycle of a port. Linear; a destroyed port cannot be reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Constructed, drain tasks not yet running.
    NotStarted,
    /// Drain tasks running, queues accepting frames.
    Running,
    /// Draining remaining outgoing frames before going quiet.
    Stopping,
    /// Endpoint released, queues and listeners cleared.
    Destroyed,
}

const STATE_NOT_STARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_DESTROYED: u8 = 3;

impl PortState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_RUNNING => PortState::Running,
            STATE_STOPPING => PortState::Stopping,
            STATE_DESTROYED => PortState::Destroyed,
            _ => PortState::NotStarted,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frame-received callback.
pub type FrameListener = Arc<dyn Fn(Frame) + Send + Sync>;

/// Handle identifying a registered frame listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// One physical link endpoint with its framing, queues, and counters.
pub struct PhysicalPort {
    weak: Weak<PhysicalPort>,
    state: AtomicU8,
    endpoint: Mutex<Option<(BoxedReader, BoxedWriter)>>,

    outgoing: Mutex<VecDeque<Frame>>,
    outgoing_notify: Notify,

    listeners: Mutex<Vec<(ListenerId, FrameListener)>>,
    next_listener_id: AtomicU64,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
    link_failed: AtomicBool,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    corrupt: AtomicU64,
}

impl PhysicalPort {
    /// Wrap a duplex endpoint (serial link, socket, in-memory pipe).
    pub fn new(endpoint: impl AsyncRead + AsyncWrite + Send + Unpin + 'static) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(endpoint);
        let (running_tx, running_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            state: AtomicU8::new(STATE_NOT_STARTED),
            endpoint: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
            outgoing: Mutex::new(VecDeque::new()),
            outgoing_notify: Notify::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            running_tx,
            running_rx,
            finished_tx,
            finished_rx,
            link_failed: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            corrupt: AtomicU64::new(0),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PortState {
        PortState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Spawn the write, read, and dispatch tasks.
    ///
    /// Fails with `InvalidState` if the port is already running or
    /// destroyed.
    pub fn start(&self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_NOT_STARTED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| SerialMuxError::InvalidState("transport already started or destroyed"))?;

        let (reader, writer) = self
            .endpoint
            .lock()
            .unwrap()
            .take()
            .ok_or(SerialMuxError::InvalidState("endpoint already consumed"))?;

        let port = self
            .weak
            .upgrade()
            .ok_or(SerialMuxError::InvalidState("transport dropped"))?;

        let _ = self.running_tx.send(true);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(write_loop(port.clone(), writer)));
        tasks.push(tokio::spawn(read_loop(port.clone(), reader, frames_tx)));
        tasks.push(tokio::spawn(dispatch_loop(port, frames_rx)));

        Ok(())
    }

    /// Append frames to the outgoing queue. Never blocks.
    pub fn enqueue_out(&self, frames: Vec<Frame>) -> Result<()> {
        self.ensure_running()?;

        if frames.is_empty() {
            return Ok(());
        }

        self.outgoing.lock().unwrap().extend(frames);
        self.outgoing_notify.notify_one();
        Ok(())
    }

    /// Frame-encode a serialized control message (channel 0) and push it to
    /// the front of the outgoing queue; control traffic preempts data.
    pub fn publish_control(&self, message: &str) -> Result<()> {
        self.ensure_running()?;

        self.outgoing
            .lock()
            .unwrap()
            .push_front(Frame::control(message));
        self.outgoing_notify.notify_one();
        Ok(())
    }

    /// Current outgoing queue depth, used to pick among bound transports.
    pub fn back_pressure(&self) -> usize {
        self.outgoing.lock().unwrap().len()
    }

    /// Register a frame-received listener.
    pub fn on_frame_received<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a previously registered listener. Unknown ids are ignored.
    pub fn off_frame_received(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    /// Cumulative bytes written to the link.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Cumulative bytes read from the link.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Frames dropped as undersized or failing their CRC/header checks.
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt.load(Ordering::Relaxed)
    }

    /// Stop the port: let the write task flush the remaining outgoing
    /// frames, then wait for all tasks to finish. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        match self.state() {
            PortState::Destroyed => return Ok(()),
            PortState::NotStarted => {
                self.state.store(STATE_STOPPING, Ordering::Release);
                let _ = self.finished_tx.send(true);
                return Ok(());
            }
            _ => {}
        }

        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let _ = self.running_tx.send(false);
            self.outgoing_notify.notify_one();
        }

        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Stop, release the endpoint, clear listeners and queues.
    /// The port is unusable afterwards.
    pub async fn destroy(&self) {
        let _ = self.stop().await;
        self.state.store(STATE_DESTROYED, Ordering::Release);
        self.outgoing.lock().unwrap().clear();
        self.listeners.lock().unwrap().clear();
        *self.endpoint.lock().unwrap() = None;
    }

    /// Wait until the port has drained and stopped.
    ///
    /// Returns `Err(ConnectionClosed)` when the underlying link failed
    /// unexpectedly; there is no recovery path for a dropped physical
    /// link, so callers should treat this as fatal for the session.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let mut finished = self.finished_rx.clone();
        finished
            .wait_for(|done| *done)
            .await
            .map_err(|_| SerialMuxError::ConnectionClosed)?;

        if self.link_failed.load(Ordering::Acquire) {
            Err(SerialMuxError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            PortState::Running => Ok(()),
            PortState::Destroyed => Err(SerialMuxError::InvalidState("transport is destroyed")),
            _ => Err(SerialMuxError::InvalidState("transport is not running")),
        }
    }

    fn pop_outgoing(&self) -> Option<Frame> {
        self.outgoing.lock().unwrap().pop_front()
    }

    fn fail_link(&self) {
        self.link_failed.store(true, Ordering::Release);
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let _ = self.running_tx.send(false);
            self.outgoing_notify.notify_one();
        }
    }
}

/// Outgoing drain task: one frame write + flush per iteration.
async fn write_loop(port: Arc<PhysicalPort>, mut writer: BoxedWriter) {
    loop {
        let frame = loop {
            let notified = port.outgoing_notify.notified();
            if let Some(frame) = port.pop_outgoing() {
                break Some(frame);
            }
            if port.state() != PortState::Running {
                break None;
            }
            notified.await;
        };

        let Some(frame) = frame else { break };

        let body = frame.encode();
        let mut wire = Vec::with_capacity(body.len() + 2);
        wire.push(FRAME_BEGIN);
        wire.extend_from_slice(&body);
        wire.push(FRAME_END);

        let result = async {
            writer.write_all(&wire).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!("Link write failed: {}", e);
            port.fail_link();
            break;
        }

        port.bytes_out.fetch_add(wire.len() as u64, Ordering::Relaxed);
    }

    let _ = port.finished_tx.send(true);
}

/// Inbound drain task: read bytes, reassemble and parse frames, hand
/// survivors to the dispatch queue. Corrupt frames are dropped and
/// counted, never retried.
async fn read_loop(
    port: Arc<PhysicalPort>,
    mut reader: BoxedReader,
    frames: mpsc::UnboundedSender<Frame>,
) {
    let mut scanner = FrameScanner::new();
    let mut running = port.running_rx.clone();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    if port.state() == PortState::Running {
                        tracing::error!("Physical link closed unexpectedly");
                        port.fail_link();
                    }
                    break;
                }
                Ok(n) => {
                    port.bytes_in.fetch_add(n as u64, Ordering::Relaxed);

                    let dropped_before = scanner.dropped_frames();
                    for body in scanner.push(&buf[..n]) {
                        match Frame::parse(&body) {
                            Ok(frame) => {
                                let _ = frames.send(frame);
                            }
                            Err(e) => {
                                tracing::warn!("Dropping corrupt frame: {}", e);
                                port.corrupt.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    let dropped = scanner.dropped_frames() - dropped_before;
                    if dropped > 0 {
                        port.corrupt.fetch_add(dropped, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    if port.state() == PortState::Running {
                        tracing::error!("Link read failed: {}", e);
                        port.fail_link();
                    }
                    break;
                }
            }
        }
    }
}

/// Fan received frames out to the registered listeners, in registration
/// order. Exits when the read task closes the queue.
async fn dispatch_loop(port: Arc<PhysicalPort>, mut frames: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        let listeners: Vec<FrameListener> = port
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc as tokio_mpsc;

    fn collect_frames(port: &Arc<PhysicalPort>) -> tokio_mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        port.on_frame_received(move |frame| {
            let _ = tx.send(frame);
        });
        rx
    }

    #[tokio::test]
    async fn test_enqueue_before_start_fails() {
        let (a, _b) = duplex(4096);
        let port = PhysicalPort::new(a);

        let result = port.enqueue_out(vec![Frame::data(&b"x"[..], 1)]);
        assert!(matches!(result, Err(SerialMuxError::InvalidState(_))));
        assert_eq!(port.state(), PortState::NotStarted);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let (a, _b) = duplex(4096);
        let port = PhysicalPort::new(a);

        port.start().unwrap();
        assert!(matches!(
            port.start(),
            Err(SerialMuxError::InvalidState(_))
        ));

        port.destroy().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_destroy_fails() {
        let (a, _b) = duplex(4096);
        let port = PhysicalPort::new(a);
        port.start().unwrap();
        port.destroy().await;

        let result = port.enqueue_out(vec![Frame::data(&b"x"[..], 1)]);
        assert!(matches!(result, Err(SerialMuxError::InvalidState(_))));
        assert!(matches!(
            port.publish_control("{}"),
            Err(SerialMuxError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (a, _b) = duplex(4096);
        let port = PhysicalPort::new(a);
        port.start().unwrap();

        port.destroy().await;
        port.destroy().await;
        assert_eq!(port.state(), PortState::Destroyed);
    }

    #[tokio::test]
    async fn test_frames_cross_the_link() {
        let (a, b) = duplex(64 * 1024);
        let sender = PhysicalPort::new(a);
        let receiver = PhysicalPort::new(b);
        let mut received = collect_frames(&receiver);

        sender.start().unwrap();
        receiver.start().unwrap();

        sender
            .enqueue_out(vec![Frame::data(&b"over the wire"[..], 42)])
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(frame.channel_id, 42);
        assert_eq!(&frame.payload[..], b"over the wire");
        assert!(sender.bytes_sent() > 0);
        assert!(receiver.bytes_received() > 0);

        sender.destroy().await;
        receiver.destroy().await;
    }

    #[tokio::test]
    async fn test_control_preempts_queued_data() {
        // One-byte duplex buffer: the write task blocks mid-frame, so the
        // queue can be reordered while the first frame is in flight.
        let (a, b) = duplex(1);
        let sender = PhysicalPort::new(a);
        let receiver = PhysicalPort::new(b);
        let mut received = collect_frames(&receiver);

        sender.start().unwrap();
        receiver.start().unwrap();

        sender
            .enqueue_out(vec![Frame::data(&b"first"[..], 1)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        sender
            .enqueue_out(vec![Frame::data(&b"second"[..], 2)])
            .unwrap();
        sender
            .publish_control(r#"{"tk":"t","cmd":"PING","flag":0}"#)
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(2), received.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(frame.channel_id);
        }

        assert_eq!(order, vec![1, 0, 2]);

        sender.destroy().await;
        receiver.destroy().await;
    }

    #[tokio::test]
    async fn test_corrupt_frames_are_counted_not_fatal() {
        let (a, mut b) = duplex(4096);
        let port = PhysicalPort::new(a);
        let mut received = collect_frames(&port);
        port.start().unwrap();

        // Undersized garbage between markers, then a valid frame.
        b.write_all(&[FRAME_BEGIN, 0x41, FRAME_END]).await.unwrap();

        let frame = Frame::data(&b"still alive"[..], 3);
        let mut wire = vec![FRAME_BEGIN];
        wire.extend_from_slice(&frame.encode());
        wire.push(FRAME_END);
        b.write_all(&wire).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.channel_id, 3);
        assert_eq!(port.corrupt_frames(), 1);

        port.destroy().await;
    }

    #[tokio::test]
    async fn test_unexpected_close_is_fatal() {
        let (a, b) = duplex(4096);
        let port = PhysicalPort::new(a);
        port.start().unwrap();

        drop(b);

        let result = tokio::time::timeout(Duration::from_secs(2), port.wait_for_shutdown())
            .await
            .unwrap();
        assert!(matches!(result, Err(SerialMuxError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_clean_stop_is_not_an_error() {
        let (a, _b) = duplex(4096);
        let port = PhysicalPort::new(a);
        port.start().unwrap();

        port.stop().await.unwrap();
        assert!(port.wait_for_shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_flushes_remaining_frames() {
        let (a, b) = duplex(64 * 1024);
        let sender = PhysicalPort::new(a);
        let receiver = PhysicalPort::new(b);
        let mut received = collect_frames(&receiver);

        sender.start().unwrap();
        receiver.start().unwrap();

        for i in 0..10u64 {
            sender
                .enqueue_out(vec![Frame::data(&b"flush me"[..], i + 1)])
                .unwrap();
        }
        sender.stop().await.unwrap();

        for _ in 0..10 {
            let frame = tokio::time::timeout(Duration::from_secs(2), received.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&frame.payload[..], b"flush me");
        }

        receiver.destroy().await;
    }

    #[tokio::test]
    async fn test_listener_removal() {
        let (a, b) = duplex(4096);
        let sender = PhysicalPort::new(a);
        let receiver = PhysicalPort::new(b);

        let (tx, mut rx) = tokio_mpsc::unbounded_channel();
        let id = receiver.on_frame_received(move |frame| {
            let _ = tx.send(frame);
        });
        receiver.off_frame_received(id);

        sender.start().unwrap();
        receiver.start().unwrap();

        sender
            .enqueue_out(vec![Frame::data(&b"unheard"[..], 1)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(rx.try_recv().is_err());

        sender.destroy().await;
        receiver.destroy().await;
    }

    #[tokio::test]
    async fn test_back_pressure_reflects_queue_depth() {
        let (a, b) = duplex(1);
        let port = PhysicalPort::new(a);
        port.start().unwrap();

        assert_eq!(port.back_pressure(), 0);

        // The writer blocks on the tiny buffer, so later frames pile up.
        port.enqueue_out(vec![Frame::data(&b"blocker"[..], 1)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        port.enqueue_out(Frame::slice(&[0u8; 3000], 1)).unwrap();
        assert!(port.back_pressure() >= 3);

        // Unblock the stuck write by failing the link, then tear down.
        drop(b);
        port.destroy().await;
    }
}
