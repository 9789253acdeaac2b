//! Market Data Streaming Types
//!
//! Core domain types for market data: normalized ticker symbols and
//! price ticks. These types are transport-agnostic and represent the
//! canonical internal representation shared by the upstream connector,
//! the fan-out router and client sessions.
//!
//! # Symbols
//!
//! Symbols are opaque ticker strings. Every entry point normalizes them
//! to uppercase, so `"aapl"`, `" AAPL "` and `"AAPL"` name the same
//! instrument. After normalization equality is an exact match.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Symbol
// =============================================================================

/// Maximum accepted symbol length (covers OCC option symbols).
pub const MAX_SYMBOL_LEN: usize = 32;

/// Errors produced when a raw string is not a usable symbol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    /// The symbol was empty after trimming.
    #[error("symbol cannot be empty")]
    Empty,

    /// The symbol is longer than [`MAX_SYMBOL_LEN`].
    #[error("symbol exceeds {MAX_SYMBOL_LEN} characters: {0}")]
    TooLong(String),

    /// The symbol contains whitespace or a control character.
    #[error("symbol {symbol:?} contains invalid character {character:?}")]
    InvalidCharacter {
        /// The offending (trimmed) input.
        symbol: String,
        /// The first rejected character.
        character: char,
    },
}

/// A normalized, uppercase ticker symbol.
///
/// Backed by an `Arc<str>` so that cloning a symbol (once per interested
/// session on every tick) never allocates.
///
/// # Example
///
/// ```
/// use market_relay::domain::streaming::Symbol;
///
/// let symbol = Symbol::new(" aapl ").unwrap();
/// assert_eq!(symbol.as_str(), "AAPL");
/// assert_eq!(symbol, Symbol::new("AAPL").unwrap());
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(Arc<str>);

impl Symbol {
    /// Normalize and validate a raw symbol.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError`] if the trimmed input is empty, too long, or
    /// contains whitespace or control characters.
    pub fn new(raw: &str) -> Result<Self, SymbolError> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(SymbolError::Empty);
        }
        if trimmed.chars().count() > MAX_SYMBOL_LEN {
            return Err(SymbolError::TooLong(trimmed.to_string()));
        }
        if let Some(character) = trimmed
            .chars()
            .find(|c| c.is_whitespace() || c.is_control())
        {
            return Err(SymbolError::InvalidCharacter {
                symbol: trimmed.to_string(),
                character,
            });
        }

        Ok(Self(Arc::from(trimmed.to_uppercase())))
    }

    /// Get the normalized symbol text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Symbol").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for Symbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = SymbolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl TryFrom<&str> for Symbol {
    type Error = SymbolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.as_str().to_string()
    }
}

// =============================================================================
// Tick
// =============================================================================

/// One price update for a symbol.
///
/// Ticks are immutable once constructed; fields are exposed through
/// accessors only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    symbol: Symbol,
    price: Decimal,
    timestamp: DateTime<Utc>,
}

impl Tick {
    /// Create a new tick.
    #[must_use]
    pub const fn new(symbol: Symbol, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            price,
            timestamp,
        }
    }

    /// Symbol this tick belongs to.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Traded price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Exchange timestamp of the print.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
