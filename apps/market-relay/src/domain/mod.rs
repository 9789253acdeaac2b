//! Domain Layer - Core market data types and interest tracking.
//!
//! This layer has no I/O. Types here are plain Rust with serialization
//! support and are shared by every other layer.

/// Symbols and price ticks.
pub mod streaming;

/// Reference-counted symbol interest.
pub mod subscription;
