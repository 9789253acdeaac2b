//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - [`FanoutRouter`]: routes upstream ticks to interested sessions
//! - [`ClientSession`]: one downstream consumer with its interest and queue
//! - [`FeedState`]: upstream connection status for health reporting

pub mod feed_state;
pub mod router;
pub mod session;

pub use feed_state::{ConnectionState, FeedSnapshot, FeedState};
pub use router::{DispatchReport, FanoutRouter, SessionDirectory};
pub use session::{
    ClientSession, InterestDelta, SessionConfig, SessionError, SessionHandle, SessionQueue,
    SessionState, deliver_session,
};
