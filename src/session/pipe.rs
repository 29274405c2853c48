//! The byte pumps shared by every feature handler.

use {
    std::io,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        sync::mpsc,
    },
    tokio_util::sync::CancellationToken,
    tracing::trace,
};

const COPY_BUF_LEN: usize = 8 * 1024;

/// A handle for mirroring main-stream traffic onto the log tee.
pub type TeeSender = mpsc::UnboundedSender<Vec<u8>>;

/// Copy `reader` into `writer` until EOF, then close the write half.
///
/// Each chunk is flushed immediately (this path carries interactive
/// traffic) and mirrored to `tee` when one is attached. A vanished tee
/// consumer is ignored; logging never blocks the session.
pub async fn copy_tee<R, W>(
    mut reader: R,
    mut writer: W,
    tee: Option<&TeeSender>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // EOF: propagate the half-close and let the other direction run.
            writer.shutdown().await.ok();
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        if let Some(tee) = tee {
            let _ = tee.send(buf[..n].to_vec());
        }
        total += n as u64;
    }
}

/// Bridge a stream to a local input/output pair, with half-close
/// propagation in both directions.
///
/// Local EOF closes the stream's write half but the bridge keeps running;
/// the bridge finishes when the *peer's* direction completes (or either
/// direction errors). That matches interactive use: closing stdin
/// half-closes the channel, while the far end closing ends it.
pub async fn bridge_stream<S, I, O>(
    stream: S,
    input: I,
    output: O,
    tee: Option<TeeSender>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    tokio::pin!(stream);
    let (stream_read, stream_write) = tokio::io::split(stream);

    let to_peer = copy_tee(input, stream_write, tee.as_ref());
    let from_peer = copy_tee(stream_read, output, tee.as_ref());
    tokio::pin!(to_peer, from_peer);

    let mut local_done = false;
    loop {
        tokio::select! {
            result = &mut from_peer => {
                result?;
                return Ok(());
            }
            result = &mut to_peer, if !local_done => {
                result?;
                local_done = true;
            }
        }
    }
}

/// [`bridge_stream`]'s mirror image, for bridging a spawned program: local
/// EOF (the program's output draining after it exits) finishes the bridge,
/// while peer EOF only half-closes toward the program and leaves its
/// remaining output flowing.
pub async fn bridge_process<S, I, O>(
    stream: S,
    program_output: I,
    program_input: O,
    tee: Option<TeeSender>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    tokio::pin!(stream);
    let (stream_read, stream_write) = tokio::io::split(stream);

    let to_peer = copy_tee(program_output, stream_write, tee.as_ref());
    let from_peer = copy_tee(stream_read, program_input, tee.as_ref());
    tokio::pin!(to_peer, from_peer);

    let mut peer_done = false;
    loop {
        tokio::select! {
            result = &mut to_peer => {
                result?;
                return Ok(());
            }
            result = &mut from_peer, if !peer_done => {
                result?;
                peer_done = true;
            }
        }
    }
}

/// Pump bytes both ways between two duplex endpoints until both directions
/// reach EOF, half-closing as each direction finishes. Cancellation tears
/// the pump down quietly.
pub async fn pipe_duplex<A, B>(
    mut a: A,
    mut b: B,
    cancel: &CancellationToken,
    label: &str,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => {
            let (forward, reverse) = result?;
            trace!(forward, reverse, "{label} pipe finished");
            Ok(())
        }
        () = cancel.cancelled() => Ok(()),
    }
}
