//! Downstream Client Adapters
//!
//! WebSocket transport for client sessions and the client wire format.

pub mod messages;
pub mod websocket;

pub use messages::{
    ClientAction, ClientRequest, EncodeError, EncodedFrame, RequestError, ServerMessage,
    WireFormat,
};
pub use websocket::{StreamServer, StreamServerError, WebSocketTransport};
