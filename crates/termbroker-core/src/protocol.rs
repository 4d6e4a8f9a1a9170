//! Control socket message types and payloads.
//!
//! Every frame carries a one-byte [`MessageType`] tag. Structured payloads are
//! JSON; STDIN_DATA and STDOUT_DATA carry raw bytes.

use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Numeric message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    StdinData = 0x01,
    ControlCmd = 0x02,
    StatusUpdate = 0x03,
    Heartbeat = 0x04,
    Error = 0x05,

    StdoutSubscribe = 0x10,
    StdoutData = 0x12,

    StatusRequest = 0x20,
    StatusResponse = 0x21,

    GitFollowRequest = 0x30,
    GitFollowResponse = 0x31,
    GitEventNotify = 0x32,
    GitEventAck = 0x33,
}

impl From<MessageType> for u8 {
    fn from(m: MessageType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = BrokerError;

    fn try_from(v: u8) -> BrokerResult<Self> {
        match v {
            0x01 => Ok(Self::StdinData),
            0x02 => Ok(Self::ControlCmd),
            0x03 => Ok(Self::StatusUpdate),
            0x04 => Ok(Self::Heartbeat),
            0x05 => Ok(Self::Error),
            0x10 => Ok(Self::StdoutSubscribe),
            0x12 => Ok(Self::StdoutData),
            0x20 => Ok(Self::StatusRequest),
            0x21 => Ok(Self::StatusResponse),
            0x30 => Ok(Self::GitFollowRequest),
            0x31 => Ok(Self::GitFollowResponse),
            0x32 => Ok(Self::GitEventNotify),
            0x33 => Ok(Self::GitEventAck),
            other => Err(BrokerError::protocol(format!(
                "unknown message type 0x{other:02x}"
            ))),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

/// A signal given either by name (`"SIGTERM"`, `"TERM"`) or number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalSpec {
    Number(i32),
    Name(String),
}

/// CONTROL_CMD payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlCommand {
    Resize {
        cols: u16,
        rows: u16,
    },
    Kill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<SignalSpec>,
    },
    ResetSize,
    UpdateTitle {
        title: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub app: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Any additional keys sent alongside `app`/`status`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowModeStatus {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_mode: Option<FollowModeStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFollowRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_repo_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFollowResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitEventKind {
    Checkout,
    Commit,
    Merge,
    Rebase,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitEventNotify {
    pub repo_path: String,
    #[serde(rename = "type")]
    pub kind: GitEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitEventAck {
    pub handled: bool,
}

// ── Message ───────────────────────────────────────────────────────────

/// A decoded control-socket message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StdinData(String),
    ControlCmd(ControlCommand),
    StatusUpdate(StatusUpdate),
    Heartbeat,
    Error(ErrorMessage),
    StdoutSubscribe,
    StdoutData(Vec<u8>),
    StatusRequest,
    StatusResponse(StatusResponse),
    GitFollowRequest(GitFollowRequest),
    GitFollowResponse(GitFollowResponse),
    GitEventNotify(GitEventNotify),
    GitEventAck(GitEventAck),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::StdinData(_) => MessageType::StdinData,
            Message::ControlCmd(_) => MessageType::ControlCmd,
            Message::StatusUpdate(_) => MessageType::StatusUpdate,
            Message::Heartbeat => MessageType::Heartbeat,
            Message::Error(_) => MessageType::Error,
            Message::StdoutSubscribe => MessageType::StdoutSubscribe,
            Message::StdoutData(_) => MessageType::StdoutData,
            Message::StatusRequest => MessageType::StatusRequest,
            Message::StatusResponse(_) => MessageType::StatusResponse,
            Message::GitFollowRequest(_) => MessageType::GitFollowRequest,
            Message::GitFollowResponse(_) => MessageType::GitFollowResponse,
            Message::GitEventNotify(_) => MessageType::GitEventNotify,
            Message::GitEventAck(_) => MessageType::GitEventAck,
        }
    }

    /// Serialize the payload (without the frame header).
    pub fn encode_payload(&self) -> BrokerResult<Vec<u8>> {
        let bytes = match self {
            Message::StdinData(text) => text.as_bytes().to_vec(),
            Message::StdoutData(data) => data.clone(),
            Message::Heartbeat | Message::StdoutSubscribe => Vec::new(),
            Message::StatusRequest => b"{}".to_vec(),
            Message::ControlCmd(cmd) => serde_json::to_vec(cmd)?,
            Message::StatusUpdate(update) => serde_json::to_vec(update)?,
            Message::Error(err) => serde_json::to_vec(err)?,
            Message::StatusResponse(resp) => serde_json::to_vec(resp)?,
            Message::GitFollowRequest(req) => serde_json::to_vec(req)?,
            Message::GitFollowResponse(resp) => serde_json::to_vec(resp)?,
            Message::GitEventNotify(ev) => serde_json::to_vec(ev)?,
            Message::GitEventAck(ack) => serde_json::to_vec(ack)?,
        };
        Ok(bytes)
    }

    /// Decode a payload for the given raw type tag.
    pub fn decode(tag: u8, payload: &[u8]) -> BrokerResult<Self> {
        let msg_type = MessageType::try_from(tag)?;
        let msg = match msg_type {
            MessageType::StdinData => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| BrokerError::protocol(format!("stdin payload is not UTF-8: {e}")))?;
                Message::StdinData(text.to_string())
            }
            MessageType::StdoutData => Message::StdoutData(payload.to_vec()),
            MessageType::Heartbeat => {
                expect_empty(msg_type, payload)?;
                Message::Heartbeat
            }
            MessageType::StdoutSubscribe => {
                expect_empty(msg_type, payload)?;
                Message::StdoutSubscribe
            }
            MessageType::StatusRequest => {
                expect_empty(msg_type, payload)?;
                Message::StatusRequest
            }
            MessageType::ControlCmd => Message::ControlCmd(json_payload(msg_type, payload)?),
            MessageType::StatusUpdate => Message::StatusUpdate(json_payload(msg_type, payload)?),
            MessageType::Error => Message::Error(json_payload(msg_type, payload)?),
            MessageType::StatusResponse => {
                Message::StatusResponse(json_payload(msg_type, payload)?)
            }
            MessageType::GitFollowRequest => {
                Message::GitFollowRequest(json_payload(msg_type, payload)?)
            }
            MessageType::GitFollowResponse => {
                Message::GitFollowResponse(json_payload(msg_type, payload)?)
            }
            MessageType::GitEventNotify => {
                Message::GitEventNotify(json_payload(msg_type, payload)?)
            }
            MessageType::GitEventAck => Message::GitEventAck(json_payload(msg_type, payload)?),
        };
        Ok(msg)
    }

    // ── Builders ──

    pub fn stdin(text: impl Into<String>) -> Self {
        Message::StdinData(text.into())
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        Message::ControlCmd(ControlCommand::Resize { cols, rows })
    }

    pub fn kill(signal: Option<SignalSpec>) -> Self {
        Message::ControlCmd(ControlCommand::Kill { signal })
    }

    pub fn reset_size() -> Self {
        Message::ControlCmd(ControlCommand::ResetSize)
    }

    pub fn update_title(title: impl Into<String>) -> Self {
        Message::ControlCmd(ControlCommand::UpdateTitle {
            title: title.into(),
        })
    }

    pub fn status(
        app: impl Into<String>,
        status: impl Into<String>,
        extra: Option<Map<String, Value>>,
    ) -> Self {
        Message::StatusUpdate(StatusUpdate {
            app: app.into(),
            status: status.into(),
            timestamp: None,
            extra: extra.unwrap_or_default(),
        })
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Message::Error(ErrorMessage {
            code: code.into(),
            message: message.into(),
            details: None,
        })
    }
}

/// Empty-payload types accept either zero bytes or an empty JSON object.
fn expect_empty(msg_type: MessageType, payload: &[u8]) -> BrokerResult<()> {
    if payload.is_empty() {
        return Ok(());
    }
    match serde_json::from_slice::<Map<String, Value>>(payload) {
        Ok(map) if map.is_empty() => Ok(()),
        _ => Err(BrokerError::protocol(format!(
            "{msg_type:?} expects an empty payload"
        ))),
    }
}

fn json_payload<T: serde::de::DeserializeOwned>(
    msg_type: MessageType,
    payload: &[u8],
) -> BrokerResult<T> {
    serde_json::from_slice(payload)
        .map_err(|e| BrokerError::protocol(format!("malformed {msg_type:?} payload: {e}")))
}
