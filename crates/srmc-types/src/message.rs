use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::IdentityId;

/// Opaque structured chat payload.
pub type ChatData = Map<String, Value>;

/// Enumerated message types carried in the `type` field of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Status,
    Command,
    /// Server-emitted reply to a `command`. Never accepted from clients.
    CommandResult,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "status" => Some(Self::Status),
            "command" => Some(Self::Command),
            "command_result" => Some(Self::CommandResult),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Status => "status",
            Self::Command => "command",
            Self::CommandResult => "command_result",
        }
    }

    /// Types a client is allowed to send.
    pub fn is_inbound(self) -> bool {
        !matches!(self, Self::CommandResult)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub name: String,
    /// Client-chosen correlation id, echoed in the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The `{ type, data }` envelope as a sum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageBody {
    Chat(ChatData),
    Status(StatusData),
    Command(CommandData),
    CommandResult(CommandReply),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Chat(_) => MessageKind::Chat,
            Self::Status(_) => MessageKind::Status,
            Self::Command(_) => MessageKind::Command,
            Self::CommandResult(_) => MessageKind::CommandResult,
        }
    }

    /// Build a body from an already-validated kind and its `data` object.
    pub fn from_parts(kind: MessageKind, data: Value) -> Result<Self, MessageError> {
        let body = match kind {
            MessageKind::Chat => match data {
                Value::Object(map) => Self::Chat(map),
                _ => return Err(MessageError::Malformed("data must be an object".into())),
            },
            MessageKind::Status => Self::Status(parse_data(kind, data)?),
            MessageKind::Command => Self::Command(parse_data(kind, data)?),
            MessageKind::CommandResult => Self::CommandResult(parse_data(kind, data)?),
        };
        Ok(body)
    }

    /// The `data` object of this body.
    pub fn data(&self) -> Value {
        match self {
            Self::Chat(map) => Value::Object(map.clone()),
            Self::Status(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            Self::Command(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            Self::CommandResult(d) => serde_json::to_value(d).unwrap_or(Value::Null),
        }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("text".into(), Value::String(text.into()));
        Self::Chat(data)
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(kind: MessageKind, data: Value) -> Result<T, MessageError> {
    if !data.is_object() {
        return Err(MessageError::Malformed("data must be an object".into()));
    }
    serde_json::from_value(data)
        .map_err(|e| MessageError::Malformed(format!("invalid {} data: {}", kind.as_str(), e)))
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// An application-level message.
///
/// On the wire: `{ "type", "data", "sender"?, "timestamp" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "Value")]
pub struct Message {
    pub body: MessageBody,
    pub sender: Option<IdentityId>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            sender: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_sender(sender: IdentityId, body: MessageBody) -> Self {
        Self {
            body,
            sender: Some(sender),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        // A `Message` always serializes: every field is a plain JSON value.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Structural validation of a decoded JSON document.
    ///
    /// Missing `timestamp` is filled with the current time.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Object(mut obj) = value else {
            return Err(MessageError::Malformed("expected a JSON object".into()));
        };

        let kind = match obj.remove("type") {
            Some(Value::String(s)) => s,
            Some(_) => return Err(MessageError::Malformed("type must be a string".into())),
            None => return Err(MessageError::Malformed("missing field `type`".into())),
        };
        let data = match obj.remove("data") {
            Some(data @ Value::Object(_)) => data,
            Some(_) => return Err(MessageError::Malformed("data must be an object".into())),
            None => return Err(MessageError::Malformed("missing field `data`".into())),
        };
        let kind = MessageKind::parse(&kind).ok_or(MessageError::UnknownType(kind))?;
        let body = MessageBody::from_parts(kind, data)?;

        let sender = match obj.remove("sender") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(IdentityId::new(s)),
            Some(_) => return Err(MessageError::Malformed("sender must be a string".into())),
        };
        let timestamp = match obj.remove("timestamp") {
            None | Some(Value::Null) => Utc::now(),
            Some(v) => serde_json::from_value(v)
                .map_err(|e| MessageError::Malformed(format!("invalid timestamp: {}", e)))?,
        };

        Ok(Self {
            body,
            sender,
            timestamp,
        })
    }
}

impl TryFrom<Value> for Message {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

#[derive(Serialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender: Option<IdentityId>,
    timestamp: DateTime<Utc>,
}

impl From<Message> for WireMessage {
    fn from(m: Message) -> Self {
        Self {
            kind: m.body.kind(),
            data: m.body.data(),
            sender: m.sender,
            timestamp: m.timestamp,
        }
    }
}

/// Key material handed to a client over the (TLS-protected) control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyGrant {
    pub epoch: u64,
    /// Base64-encoded 256-bit key.
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Plaintext control frames sent from server to client as text frames.
/// Application messages always travel as encrypted binary frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Connection accepted and registered
    Ready {
        identity: IdentityId,
        connection_id: Uuid,
        key: KeyGrant,
    },

    /// The identity's active key changed; frames after this one use it
    KeyRotated { key: KeyGrant },

    /// Soft rate limit hit; the server delays reading for `retry_after_ms`
    Throttled { retry_after_ms: u64 },
}
