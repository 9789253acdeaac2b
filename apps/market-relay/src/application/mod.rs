//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for the upstream feed and downstream transports.
pub mod ports;

/// Fan-out routing, client sessions and feed status.
pub mod services;
