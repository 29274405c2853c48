//! The master side of the main stream: local stdio bridged to the slave's
//! shell, program, or stdio, plus the window-resize pump for PTY sessions.

use {tokio_util::sync::CancellationToken, tracing::debug};

use crate::{
    protocol,
    session::{pipe, Stream},
};

/// The foreground job: pump stdin to the peer and the peer to stdout.
///
/// Stdin EOF half-closes the stream; the job ends when the slave closes
/// its side (shell exited, program finished, or its stdin closed) or the
/// session is cancelled.
pub async fn run_foreground(stream: Stream, cancel: CancellationToken) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = pipe::bridge_stream(stream, stdin, stdout, None) => {
            result?;
            debug!("main stream closed by the peer");
            Ok(())
        }
        () = cancel.cancelled() => Ok(()),
    }
}

/// Report the local window size on the dedicated resize stream: once at
/// startup, then on every size-change signal.
#[cfg(unix)]
pub async fn resize_pump(mut stream: Stream, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut winch = crate::terminal::resize_signal()?;
    let mut current = crate::terminal::size()?;
    protocol::write_frame(&mut stream, &current).await?;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            signal = winch.recv() => {
                if signal.is_none() {
                    return Ok(());
                }
                let size = crate::terminal::size()?;
                if size != current {
                    debug!(rows = size.rows, cols = size.cols, "window resized");
                    protocol::write_frame(&mut stream, &size).await?;
                    current = size;
                }
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn resize_pump(_stream: Stream, cancel: CancellationToken) -> anyhow::Result<()> {
    // No resize signal on this platform; PTY sessions are rejected during
    // configuration validation anyway.
    cancel.cancelled().await;
    Ok(())
}
