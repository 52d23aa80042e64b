//! Channel manager: id space, routing, and transport selection.
//!
//! The manager owns the `cid -> Channel` map, creates and destroys
//! channels, and routes every inbound frame either to its channel or to
//! the control channel (id 0). When several transports are bound it picks
//! the least-backlogged one for each new channel. The pick happens once at
//! channel creation and is never re-evaluated, so a channel's frames cannot
//! interleave across links.
//!
//! Frames for unknown or destroyed channels are dropped and counted, not
//! raised: a trailing in-flight frame racing a teardown is expected
//! behavior on a multiplexed link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};

use super::channel::Channel;
use crate::control::{commands, ControlChannel, ControlMessage};
use crate::error::{Result, SerialMuxError};
use crate::protocol::{Frame, CONTROL_CHANNEL_ID};
use crate::transport::PhysicalPort;

/// Which side of the link this manager plays.
///
/// Local channel ids are allocated with per-role parity (initiator odd,
/// acceptor even), which keeps the shared id space collision-free even
/// when both peers allocate concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Dials the session; allocates odd channel ids.
    Initiator,
    /// Answers the session; allocates even channel ids.
    Acceptor,
}

impl PeerRole {
    fn first_id(self) -> u64 {
        match self {
            PeerRole::Initiator => 1,
            PeerRole::Acceptor => 2,
        }
    }
}

/// Owns the channel id space of one multiplexed session.
pub struct ChannelManager {
    weak: Weak<ChannelManager>,
    name: String,
    role: PeerRole,

    next_cid: AtomicU64,
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
    ports: Mutex<Vec<Arc<PhysicalPort>>>,

    delivered: AtomicU64,
    dropped: AtomicU64,

    control: Arc<ControlChannel>,
}

impl ChannelManager {
    /// Create a manager bound to one transport.
    ///
    /// More transports can join the session via
    /// [`bind_ports`](ChannelManager::bind_ports).
    pub fn new(port: Arc<PhysicalPort>, name: impl Into<String>, role: PeerRole) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak: &Weak<ChannelManager>| Self {
            weak: weak.clone(),
            name: name.into(),
            role,
            next_cid: AtomicU64::new(role.first_id()),
            channels: Mutex::new(HashMap::new()),
            ports: Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            control: Arc::new(ControlChannel::new(weak.clone())),
        });

        manager.bind_ports(vec![port]);
        manager
    }

    /// Manager label used in logs.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which side of the link this manager plays.
    #[inline]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// The control-plane endpoint of this session.
    #[inline]
    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    /// Bind additional transports into the session.
    ///
    /// All bound transports share one inbound frame space: channel ids are
    /// unique across the whole set, and every transport feeds the same
    /// dispatcher.
    pub fn bind_ports(&self, ports: Vec<Arc<PhysicalPort>>) {
        for port in ports {
            let weak = self.weak.clone();
            port.on_frame_received(move |frame| {
                if let Some(manager) = weak.upgrade() {
                    manager.dispatch_frame(frame);
                }
            });
            self.ports.lock().unwrap().push(port);
        }
    }

    /// Create a channel.
    ///
    /// With `id` the channel binds to a peer-assigned id; without, the
    /// next local id is allocated. The channel is pinned to the transport
    /// with the lowest backpressure at this moment.
    pub fn create_channel(&self, id: Option<u64>) -> Result<Arc<Channel>> {
        let port = self.pick_port()?;
        let mut channels = self.channels.lock().unwrap();

        let cid = match id {
            Some(CONTROL_CHANNEL_ID) => {
                return Err(SerialMuxError::Protocol(
                    "channel id 0 is reserved for control".to_string(),
                ))
            }
            Some(cid) => {
                if channels.contains_key(&cid) {
                    return Err(SerialMuxError::Protocol(format!(
                        "channel {} already exists",
                        cid
                    )));
                }
                cid
            }
            None => self.next_cid.fetch_add(2, Ordering::Relaxed),
        };

        let channel = Channel::new(cid, port);
        channels.insert(cid, channel.clone());
        tracing::debug!("[{}] channel {} created", self.name, cid);
        Ok(channel)
    }

    /// Look up an existing channel.
    pub fn get(&self, cid: u64) -> Option<Arc<Channel>> {
        self.channels.lock().unwrap().get(&cid).cloned()
    }

    /// Get the channel for `cid`, creating it if absent: the "peer
    /// already opened channel N for us" case.
    pub fn use_channel(&self, cid: u64) -> Result<Arc<Channel>> {
        if cid == CONTROL_CHANNEL_ID {
            return Err(SerialMuxError::Protocol(
                "channel id 0 is reserved for control".to_string(),
            ));
        }

        let port = self.pick_port()?;
        let mut channels = self.channels.lock().unwrap();

        if let Some(channel) = channels.get(&cid) {
            return Ok(channel.clone());
        }

        let channel = Channel::new(cid, port);
        channels.insert(cid, channel.clone());
        Ok(channel)
    }

    /// Ids of all live channels.
    pub fn channel_ids(&self) -> Vec<u64> {
        self.channels.lock().unwrap().keys().copied().collect()
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Remove and destroy a channel. Idempotent; unknown ids are ignored.
    pub fn kill(&self, cid: u64, reason: &str) {
        if let Some(channel) = self.channels.lock().unwrap().remove(&cid) {
            tracing::debug!("[{}] channel {} killed: {}", self.name, cid, reason);
            channel.destroy();
        }
    }

    /// Frames delivered to a channel since construction.
    pub fn delivered_frames(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames dropped for unknown or destroyed channels.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the peer to allocate a channel, then register it locally.
    ///
    /// Fails with [`SerialMuxError::RpcTimeout`] when the peer does not
    /// answer within `timeout`.
    pub async fn require_connection(&self, timeout: Duration) -> Result<Arc<Channel>> {
        let reply = self
            .control
            .call_remote_proc(commands::ESTABLISH, None, timeout)
            .await?;

        let cid = reply
            .data
            .as_ref()
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                SerialMuxError::Protocol("ESTABLISH reply carries no channel id".to_string())
            })?;

        self.use_channel(cid)
    }

    /// Ask the peer to tear a channel down, then kill it locally whether
    /// or not the acknowledgement arrived (best-effort teardown).
    pub async fn release_connection(&self, channel: &Arc<Channel>, timeout: Duration) -> Result<()> {
        let cid = channel.cid();

        let ack = self
            .control
            .call_remote_proc(commands::DISPOSE, Some(json!(cid)), timeout)
            .await;
        if let Err(e) = ack {
            tracing::warn!("[{}] DISPOSE of channel {} unacknowledged: {}", self.name, cid, e);
        }

        self.kill(cid, "released");
        Ok(())
    }

    /// Kill every channel. Bound transports stay with their owner.
    pub fn destroy(&self) {
        let channels: Vec<Arc<Channel>> = {
            let mut map = self.channels.lock().unwrap();
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.destroy();
        }
    }

    /// Route one inbound frame: channel 0 to the control processor,
    /// everything else to its channel's read queue.
    pub fn dispatch_frame(&self, frame: Frame) {
        if frame.is_control() {
            match std::str::from_utf8(&frame.payload) {
                Ok(text) => self.control.process_message(text),
                Err(e) => tracing::warn!("Discarding non-UTF8 control payload: {}", e),
            }
            return;
        }

        let channel = self.channels.lock().unwrap().get(&frame.channel_id).cloned();

        match channel {
            Some(channel) if !channel.is_destroyed() => {
                if frame.is_end_of_stream() {
                    channel.deliver(None);
                } else {
                    channel.deliver(Some(frame.payload.clone()));
                }
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                tracing::debug!(
                    "[{}] DROP frame {} for channel {}",
                    self.name,
                    frame.frame_id,
                    frame.channel_id
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Serialize a control message onto the least-backlogged transport.
    pub(crate) fn publish_control_message(&self, msg: &ControlMessage) -> Result<()> {
        let json = msg.to_json()?;
        self.pick_port()?.publish_control(&json)
    }

    fn pick_port(&self) -> Result<Arc<PhysicalPort>> {
        self.ports
            .lock()
            .unwrap()
            .iter()
            .min_by_key(|port| port.back_pressure())
            .cloned()
            .ok_or(SerialMuxError::InvalidState("no transport bound"))
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("channels", &self.channel_count())
            .finish()
    }
}
