//! WebSocket transport: the upgrade handshakes and a byte-stream adapter.
//!
//! The session layers above expect a plain byte pipe, so WebSocket framing
//! is hidden here: writes become binary messages, reads drain binary
//! messages into a buffer, and a close frame (or the end of the message
//! stream) reads as EOF.

use {
    bytes::Bytes,
    futures::{ready, Sink, Stream},
    std::{
        cmp, io,
        pin::Pin,
        task::{Context, Poll},
    },
    tokio::io::{AsyncRead, AsyncWrite, ReadBuf},
    tokio_tungstenite::{
        accept_async, client_async,
        tungstenite::{Error as WsError, Message},
        WebSocketStream,
    },
};

use crate::protocol::format_addr;

/// A WebSocket connection presented as ordinary tokio byte-stream I/O.
pub struct WsByteStream<T> {
    inner: WebSocketStream<T>,
    read_buf: Bytes,
}

impl<T> WsByteStream<T> {
    fn new(inner: WebSocketStream<T>) -> Self {
        WsByteStream {
            inner,
            read_buf: Bytes::new(),
        }
    }
}

fn to_io(error: WsError) -> io::Error {
    match error {
        WsError::Io(error) => error,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<T> AsyncRead for WsByteStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = cmp::min(buf.remaining(), this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = data,
                Some(Ok(Message::Text(text))) => this.read_buf = Bytes::from(text),
                // Pings are answered by the library during polling.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()))
                }
                Some(Err(error)) => return Poll::Ready(Err(to_io(error))),
            }
        }
    }
}

impl<T> AsyncWrite for WsByteStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(to_io)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.get_mut().inner).poll_close(cx) {
            Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                Poll::Ready(Ok(()))
            }
            other => other.map_err(to_io),
        }
    }
}

/// Run the client side of the WebSocket upgrade over an established stream.
pub async fn connect<T>(
    stream: T,
    secure: bool,
    host: &str,
    port: u16,
) -> Result<WsByteStream<T>, WsError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let scheme = if secure { "wss" } else { "ws" };
    let url = format!("{}://{}/", scheme, format_addr(host, port));
    let (inner, _response) = client_async(url, stream).await?;
    Ok(WsByteStream::new(inner))
}

/// Run the server side of the WebSocket upgrade over an accepted stream.
pub async fn accept<T>(stream: T) -> Result<WsByteStream<T>, WsError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    Ok(WsByteStream::new(accept_async(stream).await?))
}
