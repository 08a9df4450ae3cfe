//! Data Relay Module
//!
//! Dials the loopback upstream and pumps bytes between a WebSocket session
//! and the upstream TCP connection.

pub mod dialer;
pub mod engine;
pub mod session;

pub use dialer::UpstreamDialer;
pub use engine::{Direction, PumpEnd, RelayEngine, RelayOutcome, UPSTREAM_CHUNK_SIZE};
pub use session::{RelaySession, SessionState, SessionStats};
