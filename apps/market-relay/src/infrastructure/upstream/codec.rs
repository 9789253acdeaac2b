//! Upstream Codec
//!
//! JSON decoding for upstream text frames. A frame is normally an array of
//! message objects; a bare object is accepted for control messages.
//!
//! Each element is decoded on its own, so one malformed trade in a frame
//! does not discard the well-formed messages around it.

use serde_json::Value;

use super::messages::{
    ErrorMessage, SubscriptionMessage, SuccessMessage, TradeMessage, UpstreamMessage,
};

/// Codec errors. Every variant is an upstream protocol error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Message object has no `T` discriminator.
    #[error("message has no type field")]
    MissingType,

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the upstream feed.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into its messages.
    ///
    /// Frame-level failures yield a single error; otherwise there is one
    /// result per array element.
    pub fn decode(&self, text: &str) -> Vec<Result<UpstreamMessage, CodecError>> {
        let trimmed = text.trim();

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => return vec![Err(e.into())],
        };

        match value {
            Value::Array(items) => items.into_iter().map(|item| self.decode_value(item)).collect(),
            Value::Object(_) => vec![self.decode_value(value)],
            _ => {
                let preview: String = trimmed.chars().take(50).collect();
                vec![Err(CodecError::InvalidFormat(format!(
                    "expected JSON array or object, got: {preview}"
                )))]
            }
        }
    }

    /// Decode one message object.
    fn decode_value(&self, value: Value) -> Result<UpstreamMessage, CodecError> {
        let msg_type = value
            .get("T")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingType)?
            .to_string();

        let message = match msg_type.as_str() {
            "success" => UpstreamMessage::Success(serde_json::from_value::<SuccessMessage>(value)?),
            "error" => UpstreamMessage::Error(serde_json::from_value::<ErrorMessage>(value)?),
            "subscription" => {
                UpstreamMessage::Subscription(serde_json::from_value::<SubscriptionMessage>(value)?)
            }
            "t" => UpstreamMessage::Trade(serde_json::from_value::<TradeMessage>(value)?),
            "q" | "b" | "d" | "u" | "s" | "l" | "n" => UpstreamMessage::Ignored(msg_type),
            _ => return Err(CodecError::UnknownMessageType(msg_type)),
        };

        Ok(message)
    }

    /// Encode a value to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}
