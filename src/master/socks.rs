//! A SOCKS5 (RFC 1928) front end whose CONNECT targets are dialed by the
//! slave: no-auth only, CONNECT only.

use {
    std::net::{Ipv4Addr, Ipv6Addr},
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    protocol::{self, socks, SocksSpec, StreamHeader},
    session::{pipe, Opener},
    transport::tcp,
};

/// Listen for SOCKS5 clients on the configured bind address.
pub async fn serve(
    spec: SocksSpec,
    opener: Opener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tcp::listen(&spec.host, spec.port).await?;
    info!(%spec, "SOCKS5 proxy listening");
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (client, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "SOCKS accept failed");
                        continue;
                    }
                };
                debug!(%peer, "SOCKS client connected");
                let opener = opener.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve_client(client, opener, cancel).await {
                        debug!("SOCKS client ended with error: {error:#}");
                    }
                });
            }
        }
    }
}

/// The fixed-format reply: BND address fields are zeroed, which RFC 1928
/// permits for CONNECT.
async fn reply<W>(client: &mut W, code: u8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let message = [
        socks::VERSION,
        code,
        0x00,
        socks::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    client.write_all(&message).await?;
    client.flush().await
}

/// Run one accepted client through greeting, request, tunnel.
pub async fn serve_client<S>(
    mut client: S,
    mut opener: Opener,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // Greeting: the client must offer the no-auth method.
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != socks::VERSION {
        anyhow::bail!("client spoke SOCKS version {}", head[0]);
    }
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&socks::METHOD_NO_AUTH) {
        client
            .write_all(&[socks::VERSION, socks::METHOD_UNACCEPTABLE])
            .await?;
        return Ok(());
    }
    client
        .write_all(&[socks::VERSION, socks::METHOD_NO_AUTH])
        .await?;

    // Request: `ver cmd rsv atyp addr... port`.
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let [version, command, _reserved, address_type] = request;
    if version != socks::VERSION {
        anyhow::bail!("request spoke SOCKS version {}", version);
    }
    let host = match address_type {
        socks::ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            client.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        socks::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| anyhow::anyhow!("domain name is not UTF-8"))?
        }
        socks::ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            client.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            reply(&mut client, socks::REP_GENERAL_FAILURE).await?;
            anyhow::bail!("unknown address type {}", other);
        }
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    if command != socks::CMD_CONNECT {
        // Only CONNECT is supported; no stream is opened for anything else.
        reply(&mut client, socks::REP_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }

    // Tunnel: the slave dials and reports the outcome as one status byte.
    let mut stream = opener.open_stream().await?;
    protocol::write_header(&mut stream, &StreamHeader::Socks {
        host: host.clone(),
        port,
    })
    .await?;
    let mut status = [0u8; 1];
    let code = match stream.read_exact(&mut status).await {
        Ok(_) => status[0],
        Err(_) => socks::REP_GENERAL_FAILURE,
    };
    if code != socks::REP_SUCCESS {
        debug!(dial_target = %protocol::format_addr(&host, port), code, "slave-side dial failed");
        reply(&mut client, code).await?;
        return Ok(());
    }
    reply(&mut client, socks::REP_SUCCESS).await?;
    debug!(dial_target = %protocol::format_addr(&host, port), "SOCKS tunnel established");

    pipe::pipe_duplex(client, stream, &cancel, "socks").await?;
    Ok(())
}
