//! Bridge Listener

use super::{api::BridgeApi, handlers::AppState};
use crate::{config::Config, policy::PortPolicy, Result};
use anyhow::Context;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

/// WebSocket to TCP bridge server
pub struct BridgeServer {
    listen_addr: SocketAddr,
    app_state: AppState,
    test_page: PathBuf,
}

impl BridgeServer {
    /// Create a server from validated configuration
    pub fn new(config: &Config) -> Result<Self> {
        let listen_addr = config.server.socket_addr()?;
        let policy = config
            .port_policy()
            .context("Invalid accepted upstream port list")?;

        Ok(Self::with_policy(listen_addr, policy, config.server.test_page.clone()))
    }

    /// Create a server from its parts
    pub fn with_policy(listen_addr: SocketAddr, policy: PortPolicy, test_page: PathBuf) -> Self {
        Self {
            listen_addr,
            app_state: AppState::new(policy),
            test_page,
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        BridgeApi::create_router(self.app_state.clone(), &self.test_page)
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Unable to launch server on {}", self.listen_addr))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(
            "Bridge listening on {} (accepted upstream ports: {})",
            local_addr,
            self.app_state.policy
        );

        let app = self.router();
        if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Bridge server error: {}", e);
            return Err(e.into());
        }

        info!("Bridge listener on {} stopped", local_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_from_default_config() {
        let server = BridgeServer::new(&Config::default()).unwrap();
        assert_eq!(server.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert!(server.app_state.policy.is_allowed(8484));
        assert!(server.app_state.policy.is_allowed(8585));
        let _router = server.router();
    }

    #[test]
    fn test_bad_port_list_fails_construction() {
        let mut config = Config::default();
        config.upstream.accepted_ports = "8484;8585".to_string();
        assert!(BridgeServer::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = BridgeServer::with_policy(
            listener.local_addr().unwrap(),
            PortPolicy::default(),
            PathBuf::from("test.html"),
        );

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
