//! Port forwarding, master side.
//!
//! Local forwards: this peer listens, opens a stream per accepted
//! connection, and the slave dials the target. Remote forwards run the
//! other way around: the slave listens and opens streams back to us, the
//! only stream class a master ever accepts, and we dial the target.

use {
    tokio::net::TcpStream,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    protocol::{self, ForwardSpec, StreamHeader},
    session::{pipe, IncomingStreams, Opener, Stream},
    transport::tcp,
};

/// Listen on the configured bind address and tunnel every accepted
/// connection to the slave-side target.
pub async fn serve_local(
    spec: ForwardSpec,
    opener: Opener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tcp::listen(&spec.bind_host, spec.bind_port).await?;
    info!(%spec, "local forward listening");
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (client, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        // Transient accept failures should not kill the
                        // forward; anything fatal will repeat immediately.
                        warn!(%error, "local forward accept failed");
                        continue;
                    }
                };
                debug!(%peer, dial_target = %spec.target_addr(), "forwarding connection");
                let header = StreamHeader::LocalForward {
                    host: spec.target_host.clone(),
                    port: spec.target_port,
                };
                tokio::spawn(tunnel_out(client, header, opener.clone(), cancel.clone()));
            }
        }
    }
}

/// Open a stream for one accepted connection and pipe until either side
/// closes. A dial failure on the slave shows up as immediate EOF.
async fn tunnel_out(
    client: TcpStream,
    header: StreamHeader,
    mut opener: Opener,
    cancel: CancellationToken,
) {
    let result = async {
        let mut stream = opener.open_stream().await?;
        protocol::write_header(&mut stream, &header).await?;
        pipe::pipe_duplex(client, stream, &cancel, "local-forward").await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    if let Err(error) = result {
        debug!("forwarded connection ended with error: {error:#}");
    }
}

/// Accept slave-opened streams and serve their remote-forward headers by
/// dialing the named target from this side.
pub async fn serve_remote(
    mut incoming: IncomingStreams,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = incoming.next() => {
                let stream = match next {
                    Some(stream) => stream,
                    None => return Ok(()),
                };
                tokio::spawn(tunnel_in(stream, cancel.clone()));
            }
        }
    }
}

/// Serve one slave-opened stream: parse the header, dial, pipe.
async fn tunnel_in(mut stream: Stream, cancel: CancellationToken) {
    let (host, port) = match protocol::read_header(&mut stream).await {
        Ok(StreamHeader::RemoteForward { host, port }) => (host, port),
        Ok(other) => {
            warn!(header = %other, "unexpected stream from the slave; dropping");
            return;
        }
        Err(error) => {
            warn!(%error, "malformed stream from the slave; dropping");
            return;
        }
    };
    let target = match tcp::dial(&host, port).await {
        Ok(target) => target,
        Err(error) => {
            debug!(dial_target = %protocol::format_addr(&host, port), %error, "remote forward target dial failed");
            return;
        }
    };
    if let Err(error) = pipe::pipe_duplex(target, stream, &cancel, "remote-forward").await {
        debug!("remote forwarded connection ended with error: {error:#}");
    }
}
