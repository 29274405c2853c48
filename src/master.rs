//! The master role: drives the session, owns the local listeners, and
//! fronts every feature the handshake requests.

pub mod forward;
pub mod logtee;
pub mod shell;
pub mod socks;

use {
    anyhow::Context as _,
    tokio_util::sync::CancellationToken,
    tracing::{info, info_span, Instrument},
};

pub use crate::cli::master::Cli;

use crate::{
    cli::{self, ConfigError},
    config::{MasterConfig, SessionConfig},
    protocol,
    session::{Mode, Session, Supervisor},
    signal,
    transport::{self, tls, SecureConn},
};

/// Entry for `zeekat master ...`: validate, establish, run one session.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli {
        Cli::Listen(listen) => {
            check(listen.validate())?;
            let (session_config, master_config) = listen.into_configs();
            run_listen(session_config, master_config).await
        }
        Cli::Connect(connect) => {
            check(connect.validate())?;
            let (session_config, master_config) = connect.into_configs();
            run_connect(session_config, master_config).await
        }
    }
}

fn check(errors: Vec<ConfigError>) -> anyhow::Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(cli::render_errors(&errors)))
    }
}

async fn run_listen(config: SessionConfig, features: MasterConfig) -> anyhow::Result<()> {
    let listener = transport::listen(&config).await?;
    info!(address = %listener.local_addr()?, "waiting for a slave to connect");
    let (conn, peer) = listener.accept().await?;
    info!(%peer, "slave connected");
    drop(listener);
    let conn = tls::secure_listener(conn, &config).await?;
    run_session(conn, config, features).await
}

async fn run_connect(config: SessionConfig, features: MasterConfig) -> anyhow::Result<()> {
    let conn = transport::dial(&config).await?;
    info!(host = %config.host, port = config.port, "connected to slave");
    let conn = tls::secure_dialer(conn, &config).await?;
    run_session(conn, config, features).await
}

/// Drive one complete session over an established connection.
async fn run_session(
    mut conn: SecureConn,
    config: SessionConfig,
    features: MasterConfig,
) -> anyhow::Result<()> {
    let span = info_span!("session", id = %config.session_id);
    async move {
        protocol::write_frame(&mut conn, &features.handshake())
            .await
            .context("sending the session handshake")?;

        let mut session = Session::new(conn, Mode::Client);
        let cancel = CancellationToken::new();
        signal::spawn_watcher(cancel.clone());
        let mut supervisor = Supervisor::new(cancel.clone());

        // Streams open in a fixed order the slave relies on: main first,
        // then resize if a PTY was requested, then the log tee.
        let main_stream = session.open_stream().await.context("opening main stream")?;
        let resize_stream = match features.pty {
            true => Some(session.open_stream().await.context("opening resize stream")?),
            false => None,
        };
        let log_stream = match &features.log {
            Some(_) => Some(session.open_stream().await.context("opening log stream")?),
            None => None,
        };

        // Raw mode spans the whole session in PTY mode; the guard restores
        // the terminal on every exit path out of this scope.
        let _raw_mode = match features.pty {
            true => Some(crate::terminal::enter_raw_mode()?),
            false => None,
        };

        if let Some(stream) = resize_stream {
            supervisor.spawn_background(shell::resize_pump(stream, cancel.clone()));
        }
        if let (Some(stream), Some(path)) = (log_stream, features.log.clone()) {
            supervisor.spawn_background(logtee::write_log(stream, path, cancel.clone()));
        }
        for spec in features.local_forwards.clone() {
            supervisor.spawn_background(forward::serve_local(
                spec,
                session.opener(),
                cancel.clone(),
            ));
        }
        if let Some(spec) = features.socks.clone() {
            supervisor.spawn_background(socks::serve(spec, session.opener(), cancel.clone()));
        }
        if !features.remote_forwards.is_empty() {
            supervisor.spawn_background(forward::serve_remote(
                session.take_incoming(),
                cancel.clone(),
            ));
        }

        supervisor
            .register_foreground(shell::run_foreground(main_stream, cancel.clone()))
            .expect("first and only foreground registration");

        let result = supervisor.wait().await;
        session.close().await.ok();
        info!("session closed");
        result
    }
    .instrument(span)
    .await
}
