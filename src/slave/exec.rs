//! The slave side of the main stream: plain stdio bridging, or a spawned
//! program with its stdio (or a PTY) wired to the stream.

use {
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::mpsc,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    protocol::Handshake,
    session::{
        pipe::{self, TeeSender},
        Stream,
    },
};

/// The foreground job, in whichever of the three shapes the handshake
/// asked for.
pub async fn run(
    stream: Stream,
    handshake: Handshake,
    resize_stream: Option<Stream>,
    tee: Option<TeeSender>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if handshake.exec.is_empty() {
        return run_stdio(stream, tee, cancel).await;
    }
    if handshake.pty {
        #[cfg(unix)]
        return run_pty(stream, &handshake.exec, resize_stream, tee, cancel).await;
        #[cfg(not(unix))]
        anyhow::bail!("the peer requested a PTY, which this platform does not support");
    }
    drop(resize_stream);
    run_piped(stream, &handshake.exec, tee, cancel).await
}

/// Netcat mode: bridge this process's own stdio to the stream.
async fn run_stdio(
    stream: Stream,
    tee: Option<TeeSender>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = pipe::bridge_stream(stream, stdin, stdout, tee) => {
            result?;
            debug!("main stream closed by the peer");
            Ok(())
        }
        () = cancel.cancelled() => Ok(()),
    }
}

/// Run the program with a PTY and bridge its master end to the stream.
/// Resize frames arriving on the dedicated stream are applied as they come.
#[cfg(unix)]
async fn run_pty(
    stream: Stream,
    program: &str,
    resize_stream: Option<Stream>,
    tee: Option<TeeSender>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use crate::{protocol, pty};

    let (master, resizer, mut child) = pty::spawn(program)?;
    info!(program, pid = child.id(), "program started in a PTY");

    if let Some(mut resize_stream) = resize_stream {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    frame = protocol::read_frame::<_, protocol::Resize>(&mut resize_stream) => {
                        match frame {
                            Ok(size) => {
                                if let Err(error) = resizer.resize(size) {
                                    warn!(%error, "window resize failed");
                                }
                            }
                            // The stream ends with the session; nothing to do.
                            Err(_) => return,
                        }
                    }
                }
            }
        });
    }

    let (pty_read, pty_write) = tokio::io::split(master);
    let bridge = pipe::bridge_process(stream, pty_read, pty_write, tee);
    tokio::pin!(bridge);
    // The program exiting closes the PTY slave side, which reads as EOF on
    // the master end; waiting for the bridge first means its final output
    // is fully drained into the stream before the status is collected.
    tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        result = &mut bridge => result?,
    }
    let status = child.wait().await?;
    info!(%status, "program exited");
    Ok(())
}

/// Run the program with piped stdio. Stdout and stderr are merged into
/// the stream in arrival order; the job ends once the program's output
/// has drained (the program exited), not when the peer stops typing.
async fn run_piped(
    stream: Stream,
    program: &str,
    tee: Option<TeeSender>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut child = tokio::process::Command::new(program)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    info!(program, pid = child.id(), "program started");

    let mut child_in = child.stdin.take().expect("stdin was piped");
    let child_out = child.stdout.take().expect("stdout was piped");
    let child_err = child.stderr.take().expect("stderr was piped");

    tokio::pin!(stream);
    let (mut stream_read, stream_write) = tokio::io::split(stream);

    // stdout and stderr race into one channel; whichever chunk arrives
    // first is written first.
    let (merge, merged) = mpsc::channel::<Vec<u8>>(16);
    let out_pump = read_into(child_out, merge.clone());
    let err_pump = read_into(child_err, merge);
    let writer = write_merged(merged, stream_write, tee.clone());
    let output_done = async {
        let ((), (), written) = tokio::join!(out_pump, err_pump, writer);
        written
    };
    tokio::pin!(output_done);

    let from_peer = async {
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = match stream_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Some(tee) = &tee {
                let _ = tee.send(buf[..n].to_vec());
            }
            if child_in.write_all(&buf[..n]).await.is_err() {
                break;
            }
            child_in.flush().await.ok();
        }
        // Explicitly close the pipe so the program sees stdin EOF.
        drop(child_in);
    };
    tokio::pin!(from_peer);

    let mut peer_done = false;
    let copied = loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = &mut output_done => break result,
            () = &mut from_peer, if !peer_done => peer_done = true,
        }
    };
    copied?;
    let status = child.wait().await?;
    info!(%status, "program exited");
    Ok(())
}

/// Read chunks into the merge channel until EOF or the channel closes.
async fn read_into<R>(mut reader: R, merge: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if merge.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drain the merge channel into the stream, then half-close it.
async fn write_merged<W>(
    mut merged: mpsc::Receiver<Vec<u8>>,
    mut writer: W,
    tee: Option<TeeSender>,
) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(chunk) = merged.recv().await {
        writer.write_all(&chunk).await?;
        writer.flush().await?;
        if let Some(tee) = &tee {
            let _ = tee.send(chunk);
        }
    }
    writer.shutdown().await.ok();
    Ok(())
}
