//! Upstream Port Policy
//!
//! Decides which loopback ports the bridge is permitted to dial.

pub mod ports;

pub use ports::PortPolicy;
