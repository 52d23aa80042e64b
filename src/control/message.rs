//! Control message envelope.
//!
//! Control messages travel as JSON text in channel-0 frame payloads:
//!
//! ```json
//! {"tk":"f3Xk71a2","cmd":"ESTABLISH","flag":1,"data":3,"keepAlive":true}
//! ```
//!
//! `flag` distinguishes a request (`0`, CONTROL) from a reply (`1`,
//! CALLBACK); a callback's `tk` must equal the token of the request it
//! answers. `keepAlive` on a callback leaves the requesting waiter
//! registered so further callbacks with the same token can stream in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Reserved command vocabulary. Consumers extend the set with their own
/// string tags; anything unknown is fanned out to command handlers.
pub mod commands {
    /// Peer wants a new channel; answered with the allocated id.
    pub const ESTABLISH: &str = "ESTABLISH";
    /// Peer wants a channel torn down; answered with an empty callback.
    pub const DISPOSE: &str = "DISPOSE";
}

/// Whether a message is a request or a correlated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ControlFlag {
    /// A command sent by the peer.
    Control,
    /// A reply correlated to an earlier command by token.
    Callback,
}

impl From<ControlFlag> for u8 {
    fn from(flag: ControlFlag) -> u8 {
        match flag {
            ControlFlag::Control => 0,
            ControlFlag::Callback => 1,
        }
    }
}

impl TryFrom<u8> for ControlFlag {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(ControlFlag::Control),
            1 => Ok(ControlFlag::Callback),
            other => Err(format!("unknown control flag: {}", other)),
        }
    }
}

/// One control-plane message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Correlation token; filled in by the control channel before sending.
    #[serde(rename = "tk", default)]
    pub token: Option<String>,
    /// Command tag.
    #[serde(rename = "cmd")]
    pub command: String,
    /// Request or callback.
    pub flag: ControlFlag,
    /// Command-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// On a callback: keep the waiter registered for more replies.
    #[serde(rename = "keepAlive", default, skip_serializing_if = "is_false")]
    pub keep_alive: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ControlMessage {
    /// Build a request; the control channel assigns the token on send.
    pub fn request(command: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            token: None,
            command: command.into(),
            flag: ControlFlag::Control,
            data,
            keep_alive: false,
        }
    }

    /// Build the final callback for `token`.
    pub fn callback(
        token: impl Into<String>,
        command: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            token: Some(token.into()),
            command: command.into(),
            flag: ControlFlag::Callback,
            data,
            keep_alive: false,
        }
    }

    /// Build a streaming callback for `token`; the waiter stays registered.
    pub fn callback_keep_alive(
        token: impl Into<String>,
        command: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            keep_alive: true,
            ..Self::callback(token, command, data)
        }
    }

    /// Whether this message is a correlated reply.
    #[inline]
    pub fn is_callback(&self) -> bool {
        self.flag == ControlFlag::Callback
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire form.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_keys() {
        let msg = ControlMessage {
            token: Some("abc".into()),
            command: commands::ESTABLISH.into(),
            flag: ControlFlag::Control,
            data: Some(json!(7)),
            keep_alive: false,
        };

        let parsed: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed["tk"], "abc");
        assert_eq!(parsed["cmd"], "ESTABLISH");
        assert_eq!(parsed["flag"], 0);
        assert_eq!(parsed["data"], 7);
        assert!(parsed.get("keepAlive").is_none());
    }

    #[test]
    fn test_keep_alive_serialized_when_set() {
        let msg = ControlMessage::callback_keep_alive("t", "SHELL", Some(json!("line")));
        let parsed: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed["flag"], 1);
        assert_eq!(parsed["keepAlive"], true);
    }

    #[test]
    fn test_json_roundtrip() {
        let msg = ControlMessage::callback("tok", "DISPOSE", Some(json!({"cid": 4})));
        let back = ControlMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_missing_token_parses_as_none() {
        let back = ControlMessage::from_json(r#"{"cmd":"PING","flag":0}"#).unwrap();
        assert!(back.token.is_none());
        assert!(!back.keep_alive);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(ControlMessage::from_json(r#"{"tk":"a","cmd":"PING","flag":7}"#).is_err());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(ControlMessage::from_json("not json at all").is_err());
    }
}
