//! Remote forwards, slave side: this peer listens, and each accepted
//! connection opens a stream back to the master, which dials the target.

use {
    tokio::net::TcpStream,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    protocol::{self, ForwardSpec, StreamHeader},
    session::{pipe, Opener},
    transport::tcp,
};

/// Listen on the announced bind address and tunnel every accepted
/// connection back through the session.
pub async fn serve_remote(
    spec: ForwardSpec,
    opener: Opener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tcp::listen(&spec.bind_host, spec.bind_port).await?;
    info!(%spec, "remote forward listening");
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (client, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "remote forward accept failed");
                        continue;
                    }
                };
                debug!(%peer, dial_target = %spec.target_addr(), "forwarding remote connection");
                let header = StreamHeader::RemoteForward {
                    host: spec.target_host.clone(),
                    port: spec.target_port,
                };
                tokio::spawn(tunnel_back(client, header, opener.clone(), cancel.clone()));
            }
        }
    }
}

/// Open a stream toward the master for one accepted connection. The
/// master reads the header and dials the target from its side.
async fn tunnel_back(
    client: TcpStream,
    header: StreamHeader,
    mut opener: Opener,
    cancel: CancellationToken,
) {
    let result = async {
        let mut stream = opener.open_stream().await?;
        protocol::write_header(&mut stream, &header).await?;
        pipe::pipe_duplex(client, stream, &cancel, "remote-forward").await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    if let Err(error) = result {
        debug!("remote forwarded connection ended with error: {error:#}");
    }
}
