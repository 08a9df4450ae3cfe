//! wsbridge Library
//!
//! WebSocket to TCP bridge. A browser client opens a WebSocket to the bridge
//! naming a loopback port; the bridge checks the port against a fixed
//! allow-list, dials `127.0.0.1:<port>` and relays opaque bytes both ways
//! until either side goes away.

pub mod config;
pub mod policy;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::Config;
pub use policy::PortPolicy;
pub use relay::{RelayEngine, RelaySession, UPSTREAM_CHUNK_SIZE};
pub use server::BridgeServer;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the bridge
pub type Result<T> = anyhow::Result<T>;
