//! Downstream Wire Messages
//!
//! What clients send and receive on `/stream`.
//!
//! # Inbound
//! ```json
//! {"action": "subscribe", "symbols": ["AAPL", "msft"]}
//! {"action": "unsubscribe", "symbols": ["AAPL"]}
//! ```
//!
//! # Outbound
//! ```json
//! {"type": "tick", "symbol": "AAPL", "price": "189.12", "timestamp": "2024-03-01T14:30:00Z"}
//! {"type": "subscribed", "symbols": ["AAPL", "MSFT"]}
//! {"type": "unsubscribed", "symbols": ["MSFT"]}
//! {"type": "error", "message": "..."}
//! ```
//!
//! JSON sessions exchange text frames. MessagePack sessions receive binary
//! frames with the same field names; either encoding is accepted inbound.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{Symbol, SymbolError, Tick};

// =============================================================================
// Inbound
// =============================================================================

/// Interest change requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    /// Add symbols to the session's interest.
    Subscribe,
    /// Remove symbols from the session's interest.
    Unsubscribe,
}

/// A client interest update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRequest {
    /// What to do with `symbols`.
    pub action: ClientAction,
    /// Raw symbols as sent by the client.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Failure to read a client request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Not a JSON request.
    #[error("invalid request: {0}")]
    Json(#[from] serde_json::Error),

    /// Not a MessagePack request.
    #[error("invalid request: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),

    /// A symbol failed validation.
    #[error("invalid symbol: {0}")]
    Symbol(#[from] SymbolError),
}

impl ClientRequest {
    /// Parse a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Json`] if the frame is not a valid request.
    pub fn from_json(text: &str) -> Result<Self, RequestError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse a MessagePack binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::MsgPack`] if the frame is not a valid request.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, RequestError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Normalize every requested symbol. All or nothing.
    ///
    /// # Errors
    ///
    /// Returns the first [`SymbolError`] encountered.
    pub fn normalized_symbols(&self) -> Result<Vec<Symbol>, RequestError> {
        self.symbols
            .iter()
            .map(|raw| Symbol::new(raw).map_err(RequestError::from))
            .collect()
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// A message sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A price update.
    Tick {
        /// Symbol.
        symbol: Symbol,
        /// Price, as a decimal string.
        price: Decimal,
        /// Exchange timestamp.
        timestamp: DateTime<Utc>,
    },
    /// Subscribe acknowledgement with the full interest set.
    Subscribed {
        /// Interest after the change, sorted.
        symbols: Vec<Symbol>,
    },
    /// Unsubscribe acknowledgement with the full interest set.
    Unsubscribed {
        /// Interest after the change, sorted.
        symbols: Vec<Symbol>,
    },
    /// A rejected request. The session stays open.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Build an error reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl From<&Tick> for ServerMessage {
    fn from(tick: &Tick) -> Self {
        Self::Tick {
            symbol: tick.symbol().clone(),
            price: tick.price(),
            timestamp: tick.timestamp(),
        }
    }
}

// =============================================================================
// Wire Format
// =============================================================================

/// Serialization chosen by a session at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack binary frames.
    MsgPack,
}

/// A serialized outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    /// Text frame payload.
    Text(String),
    /// Binary frame payload.
    Binary(Vec<u8>),
}

/// Failure to serialize an outbound message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// JSON serialization failed.
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack serialization failed.
    #[error("MessagePack encode error: {0}")]
    MsgPack(#[from] rmp_serde::encode::Error),
}

impl WireFormat {
    /// Serialize a message for this format.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if serialization fails.
    pub fn encode(self, message: &ServerMessage) -> Result<EncodedFrame, EncodeError> {
        match self {
            Self::Json => Ok(EncodedFrame::Text(serde_json::to_string(message)?)),
            // Named fields keep the internally tagged layout readable.
            Self::MsgPack => Ok(EncodedFrame::Binary(rmp_serde::to_vec_named(message)?)),
        }
    }
}
