//! Inbound frame validation and outbound framing.
//!
//! Inbound frames go through four checks, each with its own error kind:
//! size, AEAD decryption, envelope structure, reserved fields. Any failure
//! closes the connection that sent the frame.

use serde_json::Value;

use srmc_types::message::MessageError;
use srmc_types::{CloseCode, IdentityId, Message};

use crate::keys::{EncryptionKey, KeyError, KeyManager};
use crate::registry::ConnectionContext;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("frame could not be decrypted")]
    DecryptionFailed,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("field `{0}` requires privilege")]
    Forbidden(String),
    #[error("key failure: {0}")]
    Key(#[from] KeyError),
}

impl CodecError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::TooLarge { .. } => CloseCode::TooLarge,
            Self::DecryptionFailed => CloseCode::DecryptionFailed,
            Self::Malformed(_) => CloseCode::MalformedMessage,
            Self::UnknownType(_) => CloseCode::UnknownType,
            Self::Forbidden(_) => CloseCode::Forbidden,
            Self::Key(KeyError::DecryptionFailed) => CloseCode::DecryptionFailed,
            Self::Key(_) => CloseCode::InternalError,
        }
    }
}

impl From<MessageError> for CodecError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::Malformed(detail) => Self::Malformed(detail),
            MessageError::UnknownType(kind) => Self::UnknownType(kind),
        }
    }
}

/// An outbound frame and the key epoch it was sealed with.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub epoch: u64,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct MessageCodec {
    keys: KeyManager,
    max_frame_bytes: usize,
    forbidden_keys: Vec<String>,
}

impl MessageCodec {
    pub fn new(keys: KeyManager, max_frame_bytes: usize, forbidden_keys: Vec<String>) -> Self {
        Self {
            keys,
            max_frame_bytes,
            forbidden_keys,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Validate and decrypt one inbound frame from `conn`.
    ///
    /// The returned message's sender is always the connection's identity.
    pub async fn decode(&self, frame: &[u8], conn: &ConnectionContext) -> Result<Message, CodecError> {
        if frame.len() > self.max_frame_bytes {
            return Err(CodecError::TooLarge {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
        }

        let plaintext = self
            .keys
            .decrypt_with_fallback(&conn.identity, frame)
            .await
            .map_err(|_| CodecError::DecryptionFailed)?;

        let value: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| CodecError::Malformed(format!("invalid JSON: {}", e)))?;
        let mut message = Message::from_value(value)?;
        if !message.kind().is_inbound() {
            return Err(CodecError::UnknownType(message.kind().as_str().to_string()));
        }

        if !conn.privileged {
            if let Some(key) = self.find_forbidden(&message.body.data()) {
                return Err(CodecError::Forbidden(key));
            }
        }

        message.sender = Some(conn.identity.clone());
        Ok(message)
    }

    /// Seal `message` for `identity` under its active key.
    pub async fn encode(&self, message: &Message, identity: &IdentityId) -> Result<EncodedFrame, CodecError> {
        let key = self.keys.get_or_create_key(identity).await?;
        let bytes = self.seal(message, identity, &key)?;
        Ok(EncodedFrame {
            epoch: key.epoch,
            bytes,
        })
    }

    /// Seal `message` with a key the caller already holds.
    pub fn seal(&self, message: &Message, identity: &IdentityId, key: &EncryptionKey) -> Result<Vec<u8>, CodecError> {
        let plaintext = message.to_json_bytes();
        Ok(self.keys.encrypt_with(identity, key, &plaintext)?)
    }

    fn find_forbidden(&self, value: &Value) -> Option<String> {
        match value {
            Value::Object(map) => {
                for (key, nested) in map {
                    if self.forbidden_keys.iter().any(|f| f.eq_ignore_ascii_case(key)) {
                        return Some(key.clone());
                    }
                    if let Some(found) = self.find_forbidden(nested) {
                        return Some(found);
                    }
                }
                None
            }
            Value::Array(items) => items.iter().find_map(|v| self.find_forbidden(v)),
            _ => None,
        }
    }
}
