//! The master side of the log tee: append everything the slave mirrors
//! from the main stream into a local file.

use {
    std::path::PathBuf,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use crate::session::Stream;

/// Drain the tee stream into `path`, flushing per chunk so the log stays
/// current while the session runs. The file is this job's alone.
pub async fn write_log(
    mut stream: Stream,
    path: PathBuf,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .await?;
    info!(path = %path.display(), "session log open");

    let mut buf = [0u8; 8 * 1024];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await?;
                file.flush().await?;
            }
        }
    }
    file.flush().await?;
    Ok(())
}
