//! Adapting one connection into many ordered, flow-controlled streams.
//!
//! The yamux connection object must be polled continuously to move any
//! frame, so a [`Session`] owns a driver task that does nothing but poll
//! it, pushing inbound streams into a channel. Stream opens through the
//! control handle and reads/writes on individual streams all make progress
//! through that task; if the session is dropped, its streams die with it.

use {
    std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    },
    thiserror::Error,
    tokio::{
        io::{AsyncRead, AsyncWrite, ReadBuf},
        sync::mpsc,
        task::JoinHandle,
    },
    tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
    tracing::debug,
    yamux::{Config, Connection, ConnectionError, Control, WindowUpdateMode},
};

pub use yamux::Mode;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MuxError {
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// One logical bidirectional stream inside the session.
///
/// Closing the write half (via `shutdown`) sends FIN; the read half keeps
/// delivering whatever the peer still sends, so half-close propagates the
/// way it would on a TCP socket.
pub struct Stream {
    inner: Compat<yamux::Stream>,
}

impl Stream {
    fn new(inner: yamux::Stream) -> Self {
        Stream {
            inner: inner.compat(),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A multiplexed session over one connection.
///
/// The master runs [`Mode::Client`], the slave [`Mode::Server`]; which side
/// may open which streams is protocol discipline enforced by the feature
/// handlers, not by the multiplexer.
pub struct Session {
    control: Control,
    incoming: Option<mpsc::UnboundedReceiver<Stream>>,
    driver: JoinHandle<()>,
}

impl Session {
    pub fn new<IO>(io: IO, mode: Mode) -> Session
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut config = Config::default();
        // Credit is returned as the application reads, so one slow stream
        // exhausts only its own window.
        config.set_window_update_mode(WindowUpdateMode::OnRead);
        let connection = Connection::new(io.compat(), config, mode);
        let control = connection.control();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(connection, tx));
        Session {
            control,
            incoming: Some(rx),
            driver,
        }
    }

    /// Open a new stream. Fails once the session is closing.
    pub async fn open_stream(&mut self) -> Result<Stream, MuxError> {
        let stream = self.control.open_stream().await?;
        Ok(Stream::new(stream))
    }

    /// Accept the next stream the peer opened. Streams are produced in the
    /// order the peer opened them.
    pub async fn accept_stream(&mut self) -> Result<Stream, MuxError> {
        match self.incoming.as_mut() {
            Some(incoming) => incoming.recv().await.ok_or(MuxError::Closed),
            None => Err(MuxError::Closed),
        }
    }

    /// Hand the inbound-stream queue to a dedicated accepting task; the
    /// session itself keeps opening and closing.
    pub fn take_incoming(&mut self) -> IncomingStreams {
        IncomingStreams {
            incoming: self.incoming.take(),
        }
    }

    /// A control handle usable from other tasks to open streams.
    pub fn opener(&self) -> Opener {
        Opener {
            control: self.control.clone(),
        }
    }

    /// Close every stream and the underlying connection.
    pub async fn close(mut self) -> Result<(), MuxError> {
        self.control.close().await?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// A cloneable handle for opening streams away from the owning task.
#[derive(Clone)]
pub struct Opener {
    control: Control,
}

impl Opener {
    pub async fn open_stream(&mut self) -> Result<Stream, MuxError> {
        let stream = self.control.open_stream().await?;
        Ok(Stream::new(stream))
    }
}

/// The inbound half of a session, detached with
/// [`take_incoming`][Session::take_incoming].
pub struct IncomingStreams {
    incoming: Option<mpsc::UnboundedReceiver<Stream>>,
}

impl IncomingStreams {
    /// The next peer-opened stream, or `None` once the session ends (or
    /// the queue was already taken).
    pub async fn next(&mut self) -> Option<Stream> {
        match self.incoming.as_mut() {
            Some(incoming) => incoming.recv().await,
            None => None,
        }
    }
}

/// Poll the connection until it ends, handing inbound streams off.
///
/// The receiver may stop listening (the master only accepts streams for
/// remote forwards); inbound streams are dropped in that case, which
/// resets them, while data for existing streams keeps flowing.
async fn drive<T>(mut connection: Connection<T>, tx: mpsc::UnboundedSender<Stream>)
where
    T: futures::AsyncRead + futures::AsyncWrite + Send + Unpin + 'static,
{
    loop {
        match connection.next_stream().await {
            Ok(Some(stream)) => {
                let _ = tx.send(Stream::new(stream));
            }
            Ok(None) => break,
            Err(error) => {
                debug!(%error, "session connection ended");
                break;
            }
        }
    }
}
