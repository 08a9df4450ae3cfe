//! Bridge HTTP Server
//!
//! Accepts inbound HTTP requests, validates the requested port and upgrades
//! the relay route to a WebSocket.

pub mod api;
pub mod handlers;
pub mod listener;
pub mod types;

pub use api::BridgeApi;
pub use handlers::AppState;
pub use listener::BridgeServer;
pub use types::PortRejection;
