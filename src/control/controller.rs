//! Control-plane protocol over the reserved channel 0.
//!
//! The [`ControlChannel`] owns channel 0 by composition: it sits next to
//! the channel manager instead of specializing the data-plane channel
//! type. It provides two services:
//!
//! 1. **Peer-driven commands**: `ESTABLISH` and `DISPOSE` are handled
//!    internally against the channel manager; any other command fans out
//!    to handlers registered with
//!    [`on_command_received`](ControlChannel::on_command_received), each
//!    receiving a [`CommandContext`] for sending replies.
//! 2. **Local RPC**: [`call_remote_proc`](ControlChannel::call_remote_proc)
//!    correlates a request with its callbacks through a fresh token. A
//!    callback flagged `keepAlive` leaves the waiter registered so one
//!    call can stream multiple partial results (live shell output being
//!    the canonical consumer) before a final callback releases it.
//!
//! Malformed control messages are logged and discarded; the dispatch path
//! must survive any peer input.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::message::{commands, ControlFlag, ControlMessage};
use super::token::TokenGenerator;
use crate::channel::ChannelManager;
use crate::error::{Result, SerialMuxError};

type Waiters = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ControlMessage>>>>;
type CommandHandler = Arc<dyn Fn(ControlMessage, CommandContext) + Send + Sync>;

/// Handle identifying a registered command handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// The control-plane endpoint for one multiplexed session.
pub struct ControlChannel {
    manager: Weak<ChannelManager>,
    waiters: Waiters,
    handlers: Mutex<Vec<(HandlerId, CommandHandler)>>,
    next_handler_id: AtomicU64,
    tokens: TokenGenerator,
}

impl ControlChannel {
    pub(crate) fn new(manager: Weak<ChannelManager>) -> Self {
        Self {
            manager,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            tokens: TokenGenerator::new(),
        }
    }

    /// Register a handler for application-defined commands.
    ///
    /// Every handler sees every non-core command together with a
    /// send-back context; handlers decide by command tag.
    pub fn on_command_received<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(ControlMessage, CommandContext) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a command handler. Unknown ids are ignored.
    pub fn off_command_received(&self, id: HandlerId) {
        self.handlers.lock().unwrap().retain(|(hid, _)| *hid != id);
    }

    /// Send a command and await its single (final) callback.
    ///
    /// Fails with [`SerialMuxError::RpcTimeout`] when no callback arrives
    /// within `timeout`.
    pub async fn call_remote_proc(
        &self,
        command: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<ControlMessage> {
        let mut call = self.call_remote_streaming(command, data)?;
        match call.next(timeout).await? {
            Some(reply) => Ok(reply),
            None => Err(SerialMuxError::ConnectionClosed),
        }
    }

    /// Send a command and return a handle yielding every callback for its
    /// token, in order, until a non-keepAlive callback closes the stream.
    pub fn call_remote_streaming(
        &self,
        command: &str,
        data: Option<Value>,
    ) -> Result<RemoteCall> {
        let token = self.tokens.next_token();
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().unwrap().insert(token.clone(), tx);

        let msg = ControlMessage {
            token: Some(token.clone()),
            command: command.to_string(),
            flag: ControlFlag::Control,
            data,
            keep_alive: false,
        };

        if let Err(e) = self.publish(&msg) {
            self.waiters.lock().unwrap().remove(&token);
            return Err(e);
        }

        Ok(RemoteCall {
            token,
            rx,
            waiters: Arc::clone(&self.waiters),
        })
    }

    /// Fire-and-forget: send a command without registering a waiter.
    pub fn notify(&self, command: &str, data: Option<Value>) -> Result<()> {
        let msg = ControlMessage {
            token: Some(self.tokens.next_token()),
            command: command.to_string(),
            flag: ControlFlag::Control,
            data,
            keep_alive: false,
        };
        self.publish(&msg)
    }

    /// Process one decoded channel-0 payload. Called by the channel
    /// manager's frame dispatcher.
    pub(crate) fn process_message(&self, text: &str) {
        let msg = match ControlMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Discarding malformed control message: {}", e);
                return;
            }
        };

        let Some(token) = msg.token.clone() else {
            tracing::warn!("Discarding control message without token: {}", msg.command);
            return;
        };

        match msg.flag {
            ControlFlag::Callback => self.deliver_callback(&token, msg),
            ControlFlag::Control => self.dispatch_command(token, msg),
        }
    }

    /// Route a callback to its registered waiter. A keepAlive callback
    /// leaves the waiter in place for further replies.
    fn deliver_callback(&self, token: &str, msg: ControlMessage) {
        let mut waiters = self.waiters.lock().unwrap();

        if msg.keep_alive {
            if let Some(tx) = waiters.get(token) {
                if tx.send(msg).is_err() {
                    waiters.remove(token);
                }
            } else {
                tracing::debug!("Callback for unknown token {}", token);
            }
        } else if let Some(tx) = waiters.remove(token) {
            let _ = tx.send(msg);
        } else {
            tracing::debug!("Callback for unknown token {}", token);
        }
    }

    fn dispatch_command(&self, token: String, msg: ControlMessage) {
        match msg.command.as_str() {
            commands::ESTABLISH => {
                let Some(manager) = self.manager.upgrade() else {
                    return;
                };
                match manager.create_channel(None) {
                    Ok(channel) => {
                        let reply = ControlMessage::callback(
                            token,
                            commands::ESTABLISH,
                            Some(json!(channel.cid())),
                        );
                        if let Err(e) = manager.publish_control_message(&reply) {
                            tracing::warn!("Failed to answer ESTABLISH: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Cannot establish channel for peer: {}", e),
                }
            }
            commands::DISPOSE => {
                let Some(manager) = self.manager.upgrade() else {
                    return;
                };
                match msg.data.as_ref().and_then(Value::as_u64) {
                    Some(cid) => manager.kill(cid, "peer disposed"),
                    None => tracing::warn!("DISPOSE without a channel id"),
                }
                let reply = ControlMessage::callback(token, commands::DISPOSE, None);
                if let Err(e) = manager.publish_control_message(&reply) {
                    tracing::warn!("Failed to acknowledge DISPOSE: {}", e);
                }
            }
            _ => {
                let ctx = CommandContext {
                    token,
                    command: msg.command.clone(),
                    manager: self.manager.clone(),
                };
                let handlers: Vec<CommandHandler> = self
                    .handlers
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect();

                if handlers.is_empty() {
                    tracing::debug!("No handler for control command {}", msg.command);
                }
                for handler in handlers {
                    handler(msg.clone(), ctx.clone());
                }
            }
        }
    }

    fn publish(&self, msg: &ControlMessage) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or(SerialMuxError::ConnectionClosed)?;
        manager.publish_control_message(msg)
    }
}

/// Send-back delegate handed to command handlers.
///
/// Mirrors the callback side of the RPC contract: [`chunk`] streams a
/// keepAlive callback, [`reply`] sends the final one and releases the
/// caller's waiter.
///
/// [`chunk`]: CommandContext::chunk
/// [`reply`]: CommandContext::reply
#[derive(Clone)]
pub struct CommandContext {
    token: String,
    command: String,
    manager: Weak<ChannelManager>,
}

impl CommandContext {
    /// Correlation token of the command being answered.
    #[inline]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Command tag of the message being answered.
    #[inline]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Send a partial (keepAlive) callback; the caller keeps listening.
    pub fn chunk(&self, data: Value) -> Result<()> {
        self.send(ControlMessage::callback_keep_alive(
            self.token.clone(),
            self.command.clone(),
            Some(data),
        ))
    }

    /// Send the final callback, releasing the caller's waiter.
    pub fn reply(&self, data: Option<Value>) -> Result<()> {
        self.send(ControlMessage::callback(
            self.token.clone(),
            self.command.clone(),
            data,
        ))
    }

    fn send(&self, msg: ControlMessage) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or(SerialMuxError::ConnectionClosed)?;
        manager.publish_control_message(&msg)
    }
}

/// An in-flight remote call: yields each correlated callback in order.
pub struct RemoteCall {
    token: String,
    rx: mpsc::UnboundedReceiver<ControlMessage>,
    waiters: Waiters,
}

impl RemoteCall {
    /// Correlation token of this call.
    #[inline]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Await the next callback.
    ///
    /// `Ok(Some(_))` for each reply, `Ok(None)` once the final
    /// (non-keepAlive) callback has been consumed, `Err(RpcTimeout)` when
    /// nothing arrives within `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> Result<Option<ControlMessage>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(SerialMuxError::RpcTimeout),
        }
    }
}

impl Drop for RemoteCall {
    fn drop(&mut self) {
        // A timed-out or abandoned call must not leak its waiter.
        self.waiters.lock().unwrap().remove(&self.token);
    }
}
