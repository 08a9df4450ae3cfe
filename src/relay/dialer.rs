//! Upstream Dialer

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use anyhow::Context;
use tokio::net::TcpStream;
use tracing::debug;

use crate::Result;

/// Opens TCP connections to validated ports on the loopback interface.
///
/// No timeout and no retry: a failed dial is reported once and the client
/// has to reconnect.
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
    host: IpAddr,
}

impl UpstreamDialer {
    /// Dialer targeting `127.0.0.1`
    pub fn new() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// Address the dialer connects to for `port`
    pub fn upstream_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, port)
    }

    /// Connect to the upstream listening on `port`
    pub async fn connect(&self, port: u16) -> Result<TcpStream> {
        let addr = self.upstream_addr(port);
        debug!("Dialing upstream {}", addr);

        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Unable to connect to upstream {}", addr))?;
        stream
            .set_nodelay(true)
            .with_context(|| format!("Failed to set TCP_NODELAY on {}", addr))?;

        Ok(stream)
    }
}

impl Default for UpstreamDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_upstream_addr_is_loopback() {
        let dialer = UpstreamDialer::new();
        assert_eq!(dialer.upstream_addr(8484), "127.0.0.1:8484".parse().unwrap());
    }

    #[tokio::test]
    async fn test_connect_to_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = UpstreamDialer::new();
        let stream = dialer.connect(port).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = UpstreamDialer::new();
        let err = dialer.connect(port).await.unwrap_err();
        assert!(err.to_string().contains("Unable to connect to upstream"));
    }
}
