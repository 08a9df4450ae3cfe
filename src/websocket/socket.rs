//! Upgraded WebSocket Connection

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{ready, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use super::codec::{close_frame_for, FrameCodec};
use super::deflate::PerMessageDeflate;
use super::message::{CloseFrame, Message, CLOSE_NORMAL};

/// Buffer and size limits applied to an upgraded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Initial capacity of the inbound buffer
    pub read_buffer_size: usize,
    /// Outbound bytes buffered before a send waits for the socket
    pub write_buffer_size: usize,
    /// Largest message accepted from the client, after decompression
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

/// Server end of a WebSocket connection.
///
/// Yields client messages as a [`Stream`] and accepts server messages as a
/// [`Sink`]. Pings are answered and a client close is echoed here; callers
/// still see both. Closing the sink sends a close frame if none was sent yet
/// and then shuts the transport down.
pub struct WebSocket<S> {
    framed: Framed<S, FrameCodec>,
    close_sent: bool,
    close_received: bool,
    /// Close to send after the client broke the protocol
    violation: Option<CloseFrame>,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already upgraded transport
    pub fn from_upgraded(io: S, config: WebSocketConfig, deflate: bool) -> Self {
        let codec = FrameCodec::new(deflate.then(PerMessageDeflate::new), config.max_message_size);
        let mut framed = Framed::with_capacity(io, codec, config.read_buffer_size);
        framed.set_backpressure_boundary(config.write_buffer_size);

        Self {
            framed,
            close_sent: false,
            close_received: false,
            violation: None,
        }
    }

    /// Whether `permessage-deflate` is active on this connection
    pub fn is_compressed(&self) -> bool {
        self.framed.codec().is_compressed()
    }

    /// Queue a control reply without waiting for it to be written
    fn queue_reply(&mut self, cx: &mut Context<'_>, reply: Message) -> io::Result<()> {
        Pin::new(&mut self.framed).start_send(reply)?;
        match Pin::new(&mut self.framed).poll_flush(cx) {
            Poll::Ready(result) => result,
            // The next read or send flushes it.
            Poll::Pending => Ok(()),
        }
    }
}

impl<S> Stream for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = io::Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.close_received || this.violation.is_some() {
            return Poll::Ready(None);
        }

        let message = match ready!(Pin::new(&mut this.framed).poll_next(cx)) {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                this.violation = close_frame_for(&e);
                return Poll::Ready(Some(Err(e)));
            }
            None => return Poll::Ready(None),
        };

        match &message {
            Message::Ping(data) if !this.close_sent => {
                this.queue_reply(cx, Message::Pong(data.clone()))?;
            }
            Message::Close(frame) => {
                this.close_received = true;
                if !this.close_sent {
                    this.close_sent = true;
                    let echo = frame.as_ref().map(|f| CloseFrame::new(f.code, ""));
                    this.queue_reply(cx, Message::Close(echo))?;
                }
            }
            _ => {}
        }

        Poll::Ready(Some(Ok(message)))
    }
}

impl<S> Sink<Message> for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.framed).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, message: Message) -> io::Result<()> {
        if self.close_sent {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "WebSocket close already sent",
            ));
        }
        if matches!(message, Message::Close(_)) {
            self.close_sent = true;
        }
        Pin::new(&mut self.framed).start_send(message)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.framed).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.close_sent {
            ready!(Pin::new(&mut this.framed).poll_ready(cx))?;
            let frame = this
                .violation
                .take()
                .unwrap_or_else(|| CloseFrame::new(CLOSE_NORMAL, ""));
            Pin::new(&mut this.framed).start_send(Message::Close(Some(frame)))?;
            this.close_sent = true;
        }
        Pin::new(&mut this.framed).poll_close(cx)
    }
}
