//! The slave role: learns the session's shape from the wire handshake,
//! installs the matching handlers, and serves until the master is done.

pub mod dispatch;
pub mod exec;
pub mod forward;

use {
    anyhow::Context as _,
    tokio::{io::AsyncWriteExt, sync::mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{info, info_span, Instrument},
};

pub use crate::cli::slave::Cli;

use crate::{
    cli::{self, ConfigError},
    cleanup,
    config::SessionConfig,
    protocol::{self, Handshake},
    session::{Mode, Session, Stream, Supervisor},
    signal,
    transport::{self, tls, SecureConn},
};

/// Entry for `zeekat slave ...`: validate, establish, serve one session.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let (result, self_delete) = match cli {
        Cli::Listen(listen) => {
            check(listen.validate())?;
            let (config, self_delete) = listen.into_config();
            (run_listen(config).await, self_delete)
        }
        Cli::Connect(connect) => {
            check(connect.validate())?;
            let (config, self_delete) = connect.into_config();
            (run_connect(config).await, self_delete)
        }
    };
    if self_delete {
        cleanup::self_delete();
    }
    result
}

fn check(errors: Vec<ConfigError>) -> anyhow::Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(cli::render_errors(&errors)))
    }
}

async fn run_listen(config: SessionConfig) -> anyhow::Result<()> {
    let listener = transport::listen(&config).await?;
    info!(address = %listener.local_addr()?, "waiting for a master to connect");
    let (conn, peer) = listener.accept().await?;
    info!(%peer, "master connected");
    drop(listener);
    let conn = tls::secure_listener(conn, &config).await?;
    run_session(conn, config).await
}

async fn run_connect(config: SessionConfig) -> anyhow::Result<()> {
    let conn = transport::dial(&config).await?;
    info!(host = %config.host, port = config.port, "connected to master");
    let conn = tls::secure_dialer(conn, &config).await?;
    run_session(conn, config).await
}

/// Serve one complete session over an established connection.
async fn run_session(mut conn: SecureConn, config: SessionConfig) -> anyhow::Result<()> {
    let span = info_span!("session", id = %config.session_id);
    async move {
        let handshake: Handshake = protocol::read_frame(&mut conn)
            .await
            .context("reading the session handshake")?;
        info!(
            exec = %handshake.exec,
            pty = handshake.pty,
            log = handshake.log,
            local_forwards = handshake.local_forwards.len(),
            remote_forwards = handshake.remote_forwards.len(),
            socks = handshake.socks.is_some(),
            "session configured"
        );

        let mut session = Session::new(conn, Mode::Server);
        let cancel = CancellationToken::new();
        signal::spawn_watcher(cancel.clone());
        let mut supervisor = Supervisor::new(cancel.clone());
        let mut incoming = session.take_incoming();

        // The master opens its fixed streams in a known order: main, then
        // resize if it asked for a PTY, then the log tee.
        let main_stream = incoming
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("peer closed before opening the main stream"))?;
        let resize_stream = match handshake.pty {
            true => Some(incoming.next().await.ok_or_else(|| {
                anyhow::anyhow!("peer closed before opening the resize stream")
            })?),
            false => None,
        };
        let log_stream = match handshake.log {
            true => Some(incoming.next().await.ok_or_else(|| {
                anyhow::anyhow!("peer closed before opening the log stream")
            })?),
            false => None,
        };

        let tee = match log_stream {
            Some(stream) => {
                let (tee, mirrored) = mpsc::unbounded_channel();
                supervisor.spawn_background(tee_pump(mirrored, stream, cancel.clone()));
                Some(tee)
            }
            None => None,
        };

        for spec in handshake.remote_forwards.clone() {
            supervisor.spawn_background(forward::serve_remote(
                spec,
                session.opener(),
                cancel.clone(),
            ));
        }

        supervisor.spawn_background(dispatch::serve(incoming, cancel.clone()));

        supervisor
            .register_foreground(exec::run(
                main_stream,
                handshake,
                resize_stream,
                tee,
                cancel.clone(),
            ))
            .expect("first and only foreground registration");

        let result = supervisor.wait().await;
        session.close().await.ok();
        info!("session closed");
        result
    }
    .instrument(span)
    .await
}

/// Mirror the tee'd main-stream bytes onto the log stream. Raw bytes, no
/// framing; the master decides what to do with them.
async fn tee_pump(
    mut mirrored: mpsc::UnboundedReceiver<Vec<u8>>,
    mut stream: Stream,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            chunk = mirrored.recv() => match chunk {
                None => {
                    stream.shutdown().await.ok();
                    return Ok(());
                }
                Some(chunk) => {
                    stream.write_all(&chunk).await?;
                    stream.flush().await?;
                }
            }
        }
    }
}
