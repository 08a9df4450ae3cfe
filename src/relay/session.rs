//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle of one client's tunnel.
///
/// `Connecting -> Relaying -> Closed`, or `Connecting -> Closed` when the
/// upgrade or the upstream dial fails. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Relaying,
            _ => SessionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Connecting => 0,
            SessionState::Relaying => 1,
            SessionState::Closed => 2,
        }
    }
}

/// Represents one client's WebSocket-to-TCP tunnel
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub port: u16,
    pub upstream_addr: SocketAddr,
    pub client_addr: Option<SocketAddr>,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    state: AtomicU8,
}

/// Snapshot of a session's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: String,
    pub port: u16,
    pub upstream_addr: SocketAddr,
    pub client_addr: Option<SocketAddr>,
    pub state: SessionState,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl RelaySession {
    /// Create a new session in the `Connecting` state for a tunnel to
    /// `upstream_addr`
    pub fn new(upstream_addr: SocketAddr, client_addr: Option<SocketAddr>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        debug!("Creating relay session {} for upstream {} (client: {:?})",
               session_id, upstream_addr, client_addr);

        Self {
            session_id,
            port: upstream_addr.port(),
            upstream_addr,
            client_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Connecting.as_u8()),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `Connecting -> Relaying`. Returns false from any other state.
    pub fn mark_relaying(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting.as_u8(),
                SessionState::Relaying.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Closed`. Returns true only for the call that performed the
    /// transition, so endpoint teardown runs once.
    pub fn mark_closed(&self) -> bool {
        self.state.swap(SessionState::Closed.as_u8(), Ordering::AcqRel) != SessionState::Closed.as_u8()
    }

    /// Bytes written to the upstream (client to upstream)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes sent to the client (upstream to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Generate a statistics snapshot
    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            port: self.port,
            upstream_addr: self.upstream_addr,
            client_addr: self.client_addr,
            state: self.state(),
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        let stats = self.to_stats();
        info!(
            session_id = %stats.session_id,
            upstream_addr = %stats.upstream_addr,
            client_addr = ?stats.client_addr,
            state = ?stats.state,
            duration_ms = stats.duration_ms,
            bytes_up = stats.bytes_up,
            bytes_down = stats.bytes_down,
            total_bytes = stats.total_bytes,
            "Relay session closed"
        );
    }
}
