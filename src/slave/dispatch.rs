//! Serving the streams the master opens on demand: each one begins with a
//! header line naming its sub-protocol and dial target.

use {
    tokio::io::AsyncWriteExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    protocol::{self, socks, StreamHeader},
    session::{pipe, IncomingStreams, Stream},
    transport::tcp,
};

/// Accept master-opened streams for the rest of the session and hand each
/// one to a fresh task.
pub async fn serve(mut incoming: IncomingStreams, cancel: CancellationToken) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = incoming.next() => {
                let stream = match next {
                    Some(stream) => stream,
                    None => return Ok(()),
                };
                tokio::spawn(handle(stream, cancel.clone()));
            }
        }
    }
}

async fn handle(mut stream: Stream, cancel: CancellationToken) {
    match protocol::read_header(&mut stream).await {
        Ok(StreamHeader::LocalForward { host, port }) => {
            forward_target(stream, host, port, cancel).await
        }
        Ok(StreamHeader::Socks { host, port }) => {
            socks_target(stream, host, port, cancel).await
        }
        Ok(other) => warn!(header = %other, "unexpected stream header from the master; dropping"),
        Err(error) => warn!(%error, "dropping stream with malformed header"),
    }
}

/// Dial a forward target and pipe. A dial failure just closes the stream;
/// the master reports it as a dropped connection.
async fn forward_target(stream: Stream, host: String, port: u16, cancel: CancellationToken) {
    let target = match tcp::dial(&host, port).await {
        Ok(target) => target,
        Err(error) => {
            debug!(dial_target = %protocol::format_addr(&host, port), %error, "forward target dial failed");
            return;
        }
    };
    debug!(dial_target = %protocol::format_addr(&host, port), "forward target connected");
    if let Err(error) = pipe::pipe_duplex(target, stream, &cancel, "local-forward").await {
        debug!("forwarded connection ended with error: {error:#}");
    }
}

/// Dial a SOCKS target, report the outcome as one status byte so the
/// master can answer its client with the right reply code, then pipe.
async fn socks_target(mut stream: Stream, host: String, port: u16, cancel: CancellationToken) {
    match tcp::dial(&host, port).await {
        Ok(target) => {
            if stream.write_all(&[socks::REP_SUCCESS]).await.is_err() {
                return;
            }
            if stream.flush().await.is_err() {
                return;
            }
            debug!(dial_target = %protocol::format_addr(&host, port), "SOCKS target connected");
            if let Err(error) = pipe::pipe_duplex(target, stream, &cancel, "socks").await {
                debug!("SOCKS connection ended with error: {error:#}");
            }
        }
        Err(error) => {
            debug!(dial_target = %protocol::format_addr(&host, port), %error, "SOCKS target dial failed");
            let code = socks::reply_for_dial_error(&error);
            stream.write_all(&[code]).await.ok();
            stream.shutdown().await.ok();
        }
    }
}
