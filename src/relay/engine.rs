//! Relay Engine

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::RelaySession;
use crate::websocket::Message;

/// Largest upstream read forwarded as one WebSocket message. Kept under a
/// typical link MTU.
pub const UPSTREAM_CHUNK_SIZE: usize = 1400;

/// Upper bound on the WebSocket close handshake during teardown
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Direction of a copy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Why a copy loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// The source closed cleanly
    EndOfStream,
    ReadError(String),
    WriteError(String),
    /// The other direction finished first
    Stopped,
    Panicked(String),
}

/// Result of a finished relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Direction whose loop ended the session
    pub first_finished: Direction,
    /// How that loop ended
    pub end: PumpEnd,
}

/// Pumps bytes between one WebSocket session and one upstream connection.
///
/// Each direction runs in its own task. The session ends as soon as either
/// task exits; the other task is told to stop and both endpoints are closed
/// once.
#[derive(Debug, Clone)]
pub struct RelayEngine {
    chunk_size: usize,
}

impl RelayEngine {
    /// Create a relay engine with the default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: UPSTREAM_CHUNK_SIZE,
        }
    }

    /// Create a relay engine reading at most `chunk_size` bytes per upstream read
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Relay until either side finishes, then tear both endpoints down.
    ///
    /// `ws_tx`/`ws_rx` are the two halves of the client WebSocket and
    /// `upstream` is the dialed TCP connection.
    pub async fn run<Tx, Rx, E, U>(
        &self,
        session: Arc<RelaySession>,
        ws_tx: Tx,
        ws_rx: Rx,
        upstream: U,
    ) -> RelayOutcome
    where
        Tx: Sink<Message> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
        U: AsyncRead + AsyncWrite + Send + 'static,
    {
        if !session.mark_relaying() {
            warn!(session_id = %session.session_id, state = ?session.state(),
                  "Relay started on a session that was not connecting");
        }
        info!(session_id = %session.session_id, port = session.port, "Relaying");

        let (upstream_rx, upstream_tx) = tokio::io::split(upstream);
        let (stop_to_upstream, stop_to_upstream_rx) = oneshot::channel();
        let (stop_to_client, stop_to_client_rx) = oneshot::channel();

        let mut to_upstream = tokio::spawn(client_to_upstream(
            ws_rx,
            upstream_tx,
            Arc::clone(&session),
            stop_to_upstream_rx,
        ));
        let mut to_client = tokio::spawn(upstream_to_client(
            upstream_rx,
            ws_tx,
            Arc::clone(&session),
            self.chunk_size,
            stop_to_client_rx,
        ));

        // First to finish wins; the loser is stopped and hands back its halves.
        let (first_finished, upstream_side, client_side) = tokio::select! {
            joined = &mut to_upstream => {
                let _ = stop_to_client.send(());
                (Direction::ClientToUpstream, joined, to_client.await)
            }
            joined = &mut to_client => {
                let _ = stop_to_upstream.send(());
                (Direction::UpstreamToClient, to_upstream.await, joined)
            }
        };

        let upstream_end = end_of(&upstream_side);
        let client_end = end_of(&client_side);
        let (end, other_end, other_direction) = match first_finished {
            Direction::ClientToUpstream => (upstream_end, client_end, Direction::UpstreamToClient),
            Direction::UpstreamToClient => (client_end, upstream_end, Direction::ClientToUpstream),
        };

        log_end(&session, first_finished, &end);
        debug!(session_id = %session.session_id, direction = ?other_direction, end = ?other_end,
               "Second relay loop finished");

        if session.mark_closed() {
            if let Ok((ws_tx, _)) = client_side {
                close_client(&session, ws_tx).await;
            }
            if let Ok((mut upstream_tx, _)) = upstream_side {
                if let Err(e) = upstream_tx.shutdown().await {
                    debug!(session_id = %session.session_id, error = %e, "Upstream shutdown failed");
                }
            }
        }

        session.log_stats();

        RelayOutcome {
            first_finished,
            end,
        }
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Upstream -> client: one bounded read becomes one binary message.
async fn upstream_to_client<U, Tx>(
    mut upstream: ReadHalf<U>,
    mut ws_tx: Tx,
    session: Arc<RelaySession>,
    chunk_size: usize,
    mut stop: oneshot::Receiver<()>,
) -> (Tx, PumpEnd)
where
    U: AsyncRead,
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let mut buf = vec![0u8; chunk_size];

    let end = loop {
        let read = tokio::select! {
            biased;
            _ = &mut stop => break PumpEnd::Stopped,
            read = upstream.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break PumpEnd::EndOfStream,
            Ok(n) => n,
            Err(e) => break PumpEnd::ReadError(e.to_string()),
        };

        let sent = tokio::select! {
            biased;
            _ = &mut stop => break PumpEnd::Stopped,
            sent = ws_tx.send(Message::Binary(buf[..n].to_vec())) => sent,
        };

        if let Err(e) = sent {
            break PumpEnd::WriteError(e.to_string());
        }
        session.add_bytes_down(n as u64);
    };

    (ws_tx, end)
}

/// Client -> upstream: binary payloads are written verbatim, text is dropped.
async fn client_to_upstream<Rx, E, U>(
    mut ws_rx: Rx,
    mut upstream: WriteHalf<U>,
    session: Arc<RelaySession>,
    mut stop: oneshot::Receiver<()>,
) -> (WriteHalf<U>, PumpEnd)
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    U: AsyncWrite,
{
    let end = loop {
        let message = tokio::select! {
            biased;
            _ = &mut stop => break PumpEnd::Stopped,
            message = ws_rx.next() => message,
        };

        match message {
            None | Some(Ok(Message::Close(_))) => break PumpEnd::EndOfStream,
            Some(Ok(Message::Binary(data))) => {
                let written = tokio::select! {
                    biased;
                    _ = &mut stop => break PumpEnd::Stopped,
                    written = upstream.write_all(&data) => written,
                };

                if let Err(e) = written {
                    break PumpEnd::WriteError(e.to_string());
                }
                session.add_bytes_up(data.len() as u64);
            }
            // The upstream protocol is binary only.
            Some(Ok(Message::Text(_))) => {}
            // Answered by the WebSocket layer.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Err(e)) => break PumpEnd::ReadError(e.to_string()),
        }
    };

    (upstream, end)
}

fn end_of<T>(joined: &Result<(T, PumpEnd), JoinError>) -> PumpEnd {
    match joined {
        Ok((_, end)) => end.clone(),
        Err(e) => PumpEnd::Panicked(e.to_string()),
    }
}

fn log_end(session: &RelaySession, direction: Direction, end: &PumpEnd) {
    let session_id = session.session_id.as_str();
    match end {
        PumpEnd::EndOfStream => {
            debug!(session_id, ?direction, "Relay source closed");
        }
        PumpEnd::Stopped => {
            debug!(session_id, ?direction, "Relay loop stopped");
        }
        PumpEnd::ReadError(e) => match direction {
            Direction::UpstreamToClient => {
                warn!(session_id, error = %e, "Unable to read data from the upstream");
            }
            Direction::ClientToUpstream => {
                warn!(session_id, error = %e, "Unable to read message from the WebSocket");
            }
        },
        PumpEnd::WriteError(e) => match direction {
            Direction::UpstreamToClient => {
                warn!(session_id, error = %e, "Unable to write data to the WebSocket");
            }
            Direction::ClientToUpstream => {
                warn!(session_id, error = %e, "Unable to write data to the upstream");
            }
        },
        PumpEnd::Panicked(e) => {
            error!(session_id, ?direction, error = %e, "Relay task failed");
        }
    }
}

async fn close_client<Tx>(session: &RelaySession, mut ws_tx: Tx)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    match tokio::time::timeout(CLOSE_GRACE, ws_tx.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(session_id = %session.session_id, error = %e, "WebSocket close failed");
        }
        Err(_) => {
            debug!(session_id = %session.session_id, "WebSocket close timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::SessionState;
    use futures::channel::mpsc;
    use std::io;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    type ClientIn = mpsc::UnboundedSender<Result<Message, io::Error>>;
    type ClientOut = mpsc::UnboundedReceiver<Message>;

    fn new_session() -> Arc<RelaySession> {
        Arc::new(RelaySession::new("127.0.0.1:8484".parse().unwrap(), None))
    }

    /// Start a relay over in-memory endpoints. Returns the client's inbound
    /// sender, the client's outbound receiver, the test's end of the upstream
    /// and the relay task.
    fn start(
        engine: RelayEngine,
        session: Arc<RelaySession>,
    ) -> (
        ClientIn,
        ClientOut,
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<RelayOutcome>,
    ) {
        let (bridge_io, upstream) = tokio::io::duplex(64 * 1024);
        let (client_in_tx, client_in_rx) = mpsc::unbounded();
        let (client_out_tx, client_out_rx) = mpsc::unbounded();

        let relay = tokio::spawn(async move {
            engine.run(session, client_out_tx, client_in_rx, bridge_io).await
        });

        (client_in_tx, client_out_rx, upstream, relay)
    }

    #[tokio::test]
    async fn test_upstream_bytes_reach_client_in_bounded_chunks() {
        let session = new_session();
        let (client_in, mut client_out, mut upstream, relay) =
            start(RelayEngine::new(), Arc::clone(&session));

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        upstream.write_all(&payload).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            match timeout(WAIT, client_out.next()).await.unwrap() {
                Some(Message::Binary(chunk)) => {
                    assert!(!chunk.is_empty());
                    assert!(chunk.len() <= UPSTREAM_CHUNK_SIZE);
                    received.extend(chunk);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(received, payload);

        drop(upstream);
        let outcome = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(outcome.first_finished, Direction::UpstreamToClient);
        assert_eq!(outcome.end, PumpEnd::EndOfStream);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.bytes_down(), 5000);

        // The client side was closed during teardown.
        assert!(timeout(WAIT, client_out.next()).await.unwrap().is_none());
        drop(client_in);
    }

    #[tokio::test]
    async fn test_custom_chunk_size() {
        let session = new_session();
        let (_client_in, mut client_out, mut upstream, _relay) =
            start(RelayEngine::with_chunk_size(4), session);

        upstream.write_all(b"abcdefghij").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 10 {
            match timeout(WAIT, client_out.next()).await.unwrap() {
                Some(Message::Binary(chunk)) => {
                    assert!(chunk.len() <= 4);
                    received.extend(chunk);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(received, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_client_binary_reaches_upstream_and_text_is_dropped() {
        let session = new_session();
        let (client_in, _client_out, mut upstream, relay) =
            start(RelayEngine::new(), Arc::clone(&session));

        client_in.unbounded_send(Ok(Message::Binary(b"abc".to_vec()))).unwrap();
        client_in.unbounded_send(Ok(Message::Text("ignored".to_string()))).unwrap();
        client_in.unbounded_send(Ok(Message::Ping(b"p".to_vec()))).unwrap();
        client_in.unbounded_send(Ok(Message::Binary(b"def".to_vec()))).unwrap();
        client_in.unbounded_send(Ok(Message::Close(None))).unwrap();

        let mut received = Vec::new();
        timeout(WAIT, upstream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"abcdef");

        let outcome = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(outcome.first_finished, Direction::ClientToUpstream);
        assert_eq!(outcome.end, PumpEnd::EndOfStream);
        assert_eq!(session.bytes_up(), 6);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_client_stream_end_closes_upstream() {
        let session = new_session();
        let (client_in, _client_out, mut upstream, relay) = start(RelayEngine::new(), session);

        drop(client_in);

        let mut received = Vec::new();
        timeout(WAIT, upstream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());

        let outcome = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(outcome.first_finished, Direction::ClientToUpstream);
        assert_eq!(outcome.end, PumpEnd::EndOfStream);
    }

    #[tokio::test]
    async fn test_client_read_error_ends_session() {
        let session = new_session();
        let (client_in, _client_out, mut upstream, relay) = start(RelayEngine::new(), session);

        client_in
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        let outcome = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(outcome.first_finished, Direction::ClientToUpstream);
        assert!(matches!(outcome.end, PumpEnd::ReadError(ref e) if e.contains("reset")));

        let mut received = Vec::new();
        timeout(WAIT, upstream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_client_write_error_ends_session() {
        let session = new_session();
        let (_client_in, client_out, mut upstream, relay) = start(RelayEngine::new(), session);

        drop(client_out);
        upstream.write_all(b"nobody listening").await.unwrap();

        let outcome = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(outcome.first_finished, Direction::UpstreamToClient);
        assert!(matches!(outcome.end, PumpEnd::WriteError(_)));
    }

    #[test]
    fn test_chunk_size_is_never_zero() {
        assert_eq!(RelayEngine::with_chunk_size(0).chunk_size(), 1);
        assert_eq!(RelayEngine::new().chunk_size(), UPSTREAM_CHUNK_SIZE);
    }
}
