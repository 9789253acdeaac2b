//! Upstream WebSocket Message Types
//!
//! Wire format types for the upstream market data feed. Frames are JSON
//! arrays of objects, each discriminated by a `T` field.
//!
//! # Message Types
//!
//! ## Control Messages
//! - `success`: connection and authentication acknowledgments
//! - `error`: error response with code and message
//! - `subscription`: current subscription set after a change
//!
//! ## Market Data
//! - `t`: trade print, the only event turned into a tick
//! - `q`, `b`, `d`, `u`, `s`: quotes, bars and statuses, recognised and ignored

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{Symbol, SymbolError, Tick};

// =============================================================================
// Control Messages
// =============================================================================

/// Connection or authentication success.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "success", "msg": "connected"}
/// {"T": "success", "msg": "authenticated"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMessage {
    /// Message type (always "success")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Success message: "connected" or "authenticated"
    pub msg: SuccessKind,
}

/// Kind of success message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessKind {
    /// Initial connection established
    Connected,
    /// Authentication successful
    Authenticated,
}

/// Error message with code and description.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "error", "code": 402, "msg": "auth failed"}
/// ```
///
/// # Error Codes
/// - 400: Invalid syntax
/// - 401: Not authenticated
/// - 402: Auth failed
/// - 403: Already authenticated
/// - 404: Auth timeout
/// - 405: Symbol limit exceeded
/// - 406: Connection limit exceeded
/// - 407: Slow client
/// - 408: Insufficient subscription
/// - 500: Internal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Message type (always "error")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Error code
    pub code: i32,

    /// Error message
    pub msg: String,
}

/// Subscription confirmation.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "subscription", "trades": ["AAPL"], "quotes": [], "bars": []}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    /// Message type (always "subscription")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Subscribed trade symbols
    #[serde(default)]
    pub trades: Vec<String>,

    /// Subscribed quote symbols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quotes: Vec<String>,

    /// Subscribed bar symbols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bars: Vec<String>,
}

// =============================================================================
// Market Data
// =============================================================================

/// Trade print.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "T": "t",
///   "i": 96921,
///   "S": "AAPL",
///   "x": "D",
///   "p": 126.55,
///   "s": 1,
///   "t": "2021-02-22T15:51:44.208Z",
///   "c": ["@", "I"],
///   "z": "C"
/// }
/// ```
///
/// Only symbol, price and timestamp are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeMessage {
    /// Message type (always "t")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,

    /// Trade price
    #[serde(rename = "p")]
    pub price: Decimal,

    /// Trade timestamp (RFC-3339)
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,

    /// Trade ID
    #[serde(rename = "i", default)]
    pub trade_id: Option<i64>,

    /// Exchange code
    #[serde(rename = "x", default)]
    pub exchange: Option<String>,

    /// Trade size
    #[serde(rename = "s", default)]
    pub size: Option<i64>,

    /// Trade condition codes
    #[serde(rename = "c", default)]
    pub conditions: Vec<String>,

    /// Tape
    #[serde(rename = "z", default)]
    pub tape: Option<String>,
}

impl TradeMessage {
    /// Convert to a domain tick.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError`] if the symbol is not usable.
    pub fn to_tick(&self) -> Result<Tick, SymbolError> {
        Ok(Tick::new(
            Symbol::new(&self.symbol)?,
            self.price,
            self.timestamp,
        ))
    }
}

// =============================================================================
// Outbound Messages (Relay -> Server)
// =============================================================================

/// Authentication request.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    /// Action: "auth"
    pub action: &'static str,

    /// API key
    pub key: String,

    /// API secret
    pub secret: String,
}

impl AuthRequest {
    /// Create a new authentication request.
    #[must_use]
    pub const fn new(key: String, secret: String) -> Self {
        Self {
            action: "auth",
            key,
            secret,
        }
    }

    /// Serialize the request to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Subscribe or unsubscribe request for trade prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// Action: "subscribe" or "unsubscribe"
    pub action: &'static str,

    /// Trade symbols
    pub trades: Vec<String>,
}

impl SubscriptionRequest {
    /// Create a subscribe request.
    #[must_use]
    pub const fn subscribe() -> Self {
        Self {
            action: "subscribe",
            trades: Vec::new(),
        }
    }

    /// Create an unsubscribe request.
    #[must_use]
    pub const fn unsubscribe() -> Self {
        Self {
            action: "unsubscribe",
            trades: Vec::new(),
        }
    }

    /// Set trade symbols.
    #[must_use]
    pub fn with_trades<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.trades = symbols.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }
}

// =============================================================================
// Unified Incoming Message Enum
// =============================================================================

/// Any decoded upstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamMessage {
    /// Connection/authentication success
    Success(SuccessMessage),

    /// Error message
    Error(ErrorMessage),

    /// Subscription confirmation
    Subscription(SubscriptionMessage),

    /// Trade print
    Trade(TradeMessage),

    /// A recognised event type the relay does not forward
    Ignored(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_success_connected() {
        let json = r#"{"T":"success","msg":"connected"}"#;
        let msg: SuccessMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.msg, SuccessKind::Connected);
    }

    #[test]
    fn deserialize_error() {
        let json = r#"{"T":"error","code":401,"msg":"not authenticated"}"#;
        let msg: ErrorMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.code, 401);
        assert_eq!(msg.msg, "not authenticated");
    }

    #[test]
    fn deserialize_full_trade() {
        let json = r#"{
            "T": "t",
            "i": 96921,
            "S": "AAPL",
            "x": "D",
            "p": 126.55,
            "s": 1,
            "t": "2021-02-22T15:51:44.208Z",
            "c": ["@", "I"],
            "z": "C"
        }"#;
        let msg: TradeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.symbol, "AAPL");
        assert_eq!(msg.price, Decimal::new(12655, 2));
        assert_eq!(msg.trade_id, Some(96921));
        assert_eq!(msg.conditions, vec!["@", "I"]);
    }

    #[test]
    fn deserialize_minimal_trade_to_tick() {
        let json = r#"{"T":"t","S":"msft","p":410.5,"t":"2024-03-01T14:30:00Z"}"#;
        let msg: TradeMessage = serde_json::from_str(json).unwrap();
        let tick = msg.to_tick().unwrap();
        assert_eq!(tick.symbol().as_str(), "MSFT");
        assert_eq!(tick.price(), Decimal::new(4105, 1));
    }

    #[test]
    fn trade_with_blank_symbol_is_rejected() {
        let json = r#"{"T":"t","S":" ","p":1,"t":"2024-03-01T14:30:00Z"}"#;
        let msg: TradeMessage = serde_json::from_str(json).unwrap();
        assert!(msg.to_tick().is_err());
    }

    #[test]
    fn serialize_auth_request() {
        let json = AuthRequest::new("k".to_string(), "s".to_string())
            .to_json()
            .unwrap();
        assert_eq!(json, r#"{"action":"auth","key":"k","secret":"s"}"#);
    }

    #[test]
    fn serialize_subscription_requests() {
        let sub = SubscriptionRequest::subscribe().with_trades(["AAPL", "MSFT"]);
        assert_eq!(
            serde_json::to_string(&sub).unwrap(),
            r#"{"action":"subscribe","trades":["AAPL","MSFT"]}"#
        );

        let unsub = SubscriptionRequest::unsubscribe().with_trades(["AAPL"]);
        assert_eq!(
            serde_json::to_string(&unsub).unwrap(),
            r#"{"action":"unsubscribe","trades":["AAPL"]}"#
        );
    }
}
