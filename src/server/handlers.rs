//! Relay Route Handlers

use super::types::PortRejection;
use crate::policy::PortPolicy;
use crate::relay::{RelayEngine, RelaySession, UpstreamDialer};
use crate::websocket::{UpgradeRejection, UpgradedSocket, WebSocketConfig, WebSocketUpgrade};
use axum::{
    extract::{ConnectInfo, Query, State},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Buffer sizing for upgraded connections, large enough that typical
/// payloads are read and written in one go.
pub const WS_CONFIG: WebSocketConfig = WebSocketConfig {
    read_buffer_size: 64 * 1024,
    write_buffer_size: 64 * 1024,
    max_message_size: 16 * 1024 * 1024,
};

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<PortPolicy>,
    pub dialer: Arc<UpstreamDialer>,
    pub engine: Arc<RelayEngine>,
}

impl AppState {
    pub fn new(policy: PortPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            dialer: Arc::new(UpstreamDialer::new()),
            engine: Arc::new(RelayEngine::new()),
        }
    }
}

/// Extract and validate the `port` query parameter.
///
/// Only the first `port` parameter counts.
pub fn requested_port(
    params: &[(String, String)],
    policy: &PortPolicy,
) -> Result<u16, PortRejection> {
    let raw = params
        .iter()
        .find(|(key, _)| key == "port")
        .map(|(_, value)| value.as_str())
        .ok_or(PortRejection::Missing)?;

    let port = raw
        .parse::<i64>()
        .map_err(|_| PortRejection::Invalid(raw.to_string()))?;

    if !policy.is_allowed(port) {
        return Err(PortRejection::NotAllowed(port));
    }

    u16::try_from(port).map_err(|_| PortRejection::NotAllowed(port))
}

/// Relay route: validate the port, upgrade, dial, relay.
///
/// Any origin is accepted. The bridge is expected to sit behind other
/// access controls; the port allow-list is its only gate.
pub async fn relay_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<Vec<(String, String)>>,
    upgrade: Result<WebSocketUpgrade, UpgradeRejection>,
) -> Response {
    let client_addr = connect_info.map(|ConnectInfo(addr)| addr);

    let port = match requested_port(&params, &state.policy) {
        Ok(port) => port,
        Err(rejection) => {
            debug!(client_addr = ?client_addr, %rejection, "Relay request rejected");
            return rejection.into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(client_addr = ?client_addr, port, error = %rejection, "WebSocket upgrade failed");
            return rejection.into_response();
        }
    };

    debug!(client_addr = ?client_addr, port, compression = upgrade.deflate(), "Upgrading relay request");
    upgrade
        .config(WS_CONFIG)
        .on_failed_upgrade(move |e| {
            warn!(client_addr = ?client_addr, port, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| bridge_session(state, socket, port, client_addr))
}

/// Dial the upstream for an upgraded socket and relay until either side ends.
async fn bridge_session(
    state: AppState,
    mut socket: UpgradedSocket,
    port: u16,
    client_addr: Option<SocketAddr>,
) {
    let session = Arc::new(RelaySession::new(state.dialer.upstream_addr(port), client_addr));
    info!(
        session_id = %session.session_id,
        client_addr = ?client_addr,
        upstream_addr = %session.upstream_addr,
        compression = socket.is_compressed(),
        "WebSocket session opened"
    );

    let upstream = match state.dialer.connect(port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(session_id = %session.session_id, port, error = %e, "Unable to connect to upstream");
            session.mark_closed();
            if let Err(e) = socket.close().await {
                debug!(session_id = %session.session_id, error = %e, "WebSocket close failed");
            }
            session.log_stats();
            return;
        }
    };

    let (ws_tx, ws_rx) = socket.split();
    state.engine.run(session, ws_tx, ws_rx, upstream).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_port() {
        let policy = PortPolicy::new([8484]);
        assert_eq!(requested_port(&[], &policy), Err(PortRejection::Missing));
        assert_eq!(
            requested_port(&params(&[("host", "x")]), &policy),
            Err(PortRejection::Missing)
        );
    }

    #[test]
    fn test_non_integer_port() {
        let policy = PortPolicy::new([8484]);
        assert_eq!(
            requested_port(&params(&[("port", "abc")]), &policy),
            Err(PortRejection::Invalid("abc".to_string()))
        );
        assert_eq!(
            requested_port(&params(&[("port", "")]), &policy),
            Err(PortRejection::Invalid(String::new()))
        );
    }

    #[test]
    fn test_port_not_allowed() {
        let policy = PortPolicy::new([8484]);
        assert_eq!(
            requested_port(&params(&[("port", "9999")]), &policy),
            Err(PortRejection::NotAllowed(9999))
        );
        assert_eq!(
            requested_port(&params(&[("port", "-8484")]), &policy),
            Err(PortRejection::NotAllowed(-8484))
        );
    }

    #[test]
    fn test_allowed_port() {
        let policy = PortPolicy::new([8484, 8585]);
        assert_eq!(requested_port(&params(&[("port", "8585")]), &policy), Ok(8585));
        assert_eq!(requested_port(&params(&[("port", "+8484")]), &policy), Ok(8484));
    }

    #[test]
    fn test_first_port_parameter_wins() {
        let policy = PortPolicy::new([8484]);
        assert_eq!(
            requested_port(&params(&[("port", "8484"), ("port", "9999")]), &policy),
            Ok(8484)
        );
        assert_eq!(
            requested_port(&params(&[("port", "9999"), ("port", "8484")]), &policy),
            Err(PortRejection::NotAllowed(9999))
        );
    }
}
