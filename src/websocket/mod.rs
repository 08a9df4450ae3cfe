//! WebSocket Transport
//!
//! Server side of RFC 6455 over a connection taken over from hyper, with
//! the `permessage-deflate` extension from RFC 7692.

pub mod codec;
pub mod deflate;
pub mod message;
pub mod socket;
pub mod upgrade;

pub use message::{CloseFrame, Message};
pub use socket::{WebSocket, WebSocketConfig};
pub use upgrade::{UpgradeRejection, UpgradedSocket, WebSocketUpgrade};
