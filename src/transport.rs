//! Transport establishment: one reliable, ordered, bidirectional byte
//! stream between the peers, over TCP, WebSocket, or WebSocket-over-TLS.
//!
//! The transport contract is small: [`dial`] produces a [`Conn`], [`listen`]
//! produces a [`Listener`] whose `accept` produces [`Conn`]s. Everything
//! above this module treats a `Conn` as an opaque byte pipe; the optional
//! session TLS layer in [`tls`] wraps one after establishment.

pub mod tcp;
pub mod tls;
pub mod ws;

use {
    std::{
        fmt::{self, Display},
        io,
        net::SocketAddr,
        pin::Pin,
        str::FromStr,
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    },
    thiserror::Error,
    tokio::{
        io::{AsyncRead, AsyncWrite, ReadBuf},
        net::{TcpListener, TcpStream},
    },
    tokio_rustls::TlsAcceptor,
};

pub use tls::{SecureConn, TlsError};

use crate::config::SessionConfig;

/// The wire scheme named in a transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ws,
    Wss,
}

impl FromStr for Scheme {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Scheme::Tcp),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            other => Err(AddressError::UnknownScheme(other.to_string())),
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        })
    }
}

/// A transport address of the form `proto://host:port`.
///
/// On the command line a host of `*` (or nothing) means all interfaces for
/// a listener; it normalizes to the empty string here. Whether an empty
/// host is acceptable depends on the direction and is checked during CLI
/// validation, not parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressError {
    #[error("missing scheme: expected proto://host:port with proto one of tcp, ws, wss")]
    MissingScheme,
    #[error("unknown scheme `{0}`: expected tcp, ws, or wss")]
    UnknownScheme(String),
    #[error("missing port: expected proto://host:port")]
    MissingPort,
    #[error("invalid port `{0}`: expected a number in 1..=65535")]
    InvalidPort(String),
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://").ok_or(AddressError::MissingScheme)?;
        let scheme = scheme.parse()?;
        let (host, port) = rest.rsplit_once(':').ok_or(AddressError::MissingPort)?;
        let port = match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(AddressError::InvalidPort(port.to_string())),
            Ok(port) => port,
        };
        let host = match host {
            "*" => "",
            host => host.trim_start_matches('[').trim_end_matches(']'),
        };
        Ok(Address {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let host = if self.host.is_empty() { "*" } else { &self.host };
        write!(f, "{}://{}:{}", self.scheme, host, self.port)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One established transport connection, before the optional session TLS
/// layer. Each variant is a different stack of wrappers over the same TCP
/// socket; all of them present plain tokio byte-stream I/O.
pub enum Conn {
    Tcp(TcpStream),
    Ws(Box<ws::WsByteStream<TcpStream>>),
    WsTlsClient(Box<ws::WsByteStream<tokio_rustls::client::TlsStream<TcpStream>>>),
    WsTlsServer(Box<ws::WsByteStream<tokio_rustls::server::TlsStream<TcpStream>>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Conn::Ws(stream) => Pin::new(stream).poll_read(cx, buf),
            Conn::WsTlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
            Conn::WsTlsServer(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Conn::Ws(stream) => Pin::new(stream).poll_write(cx, buf),
            Conn::WsTlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
            Conn::WsTlsServer(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Conn::Ws(stream) => Pin::new(stream).poll_flush(cx),
            Conn::WsTlsClient(stream) => Pin::new(stream).poll_flush(cx),
            Conn::WsTlsServer(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Conn::Ws(stream) => Pin::new(stream).poll_shutdown(cx),
            Conn::WsTlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
            Conn::WsTlsServer(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Dial the configured peer, honoring the connect timeout across the whole
/// establishment (TCP connect plus any WebSocket or TLS upgrade).
pub async fn dial(config: &SessionConfig) -> Result<Conn, TransportError> {
    let establish = async {
        let stream = tcp::dial(&config.host, config.port).await?;
        match config.scheme {
            Scheme::Tcp => Ok(Conn::Tcp(stream)),
            Scheme::Ws => {
                let ws = ws::connect(stream, false, &config.host, config.port).await?;
                Ok(Conn::Ws(Box::new(ws)))
            }
            Scheme::Wss => {
                // Transport-level TLS for wss is anonymous; the keyed
                // session TLS runs inside it when requested.
                let tls = tls::connect_insecure(stream, &config.host).await?;
                let ws = ws::connect(tls, true, &config.host, config.port).await?;
                Ok(Conn::WsTlsClient(Box::new(ws)))
            }
        }
    };
    match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, establish)
            .await
            .map_err(|_| TransportError::ConnectTimeout(limit))?,
        None => establish.await,
    }
}

/// A bound transport listener. For `wss` it owns the ephemeral TLS
/// acceptor shared by every accepted connection.
pub struct Listener {
    tcp: TcpListener,
    scheme: Scheme,
    tls: Option<TlsAcceptor>,
}

/// Bind the configured listener.
pub async fn listen(config: &SessionConfig) -> Result<Listener, TransportError> {
    let tcp = tcp::listen(&config.host, config.port).await?;
    let tls = match config.scheme {
        Scheme::Wss => Some(TlsAcceptor::from(Arc::new(tls::ephemeral_server_config()?))),
        Scheme::Tcp | Scheme::Ws => None,
    };
    Ok(Listener {
        tcp,
        scheme: config.scheme,
        tls,
    })
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Accept one connection and run any WebSocket/TLS upgrade it needs.
    pub async fn accept(&self) -> Result<(Conn, SocketAddr), TransportError> {
        let (stream, peer) = self.tcp.accept().await?;
        stream.set_nodelay(true)?;
        let conn = match self.scheme {
            Scheme::Tcp => Conn::Tcp(stream),
            Scheme::Ws => Conn::Ws(Box::new(ws::accept(stream).await?)),
            Scheme::Wss => {
                let acceptor = self
                    .tls
                    .as_ref()
                    .expect("wss listener always has an acceptor");
                let tls = tls::accept_with_timeout(acceptor, stream).await?;
                Conn::WsTlsServer(Box::new(ws::accept(tls).await?))
            }
        };
        Ok((conn, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_schemes() {
        for (input, scheme) in [
            ("tcp://example:1000", Scheme::Tcp),
            ("ws://example:1000", Scheme::Ws),
            ("wss://example:1000", Scheme::Wss),
        ] {
            let address: Address = input.parse().unwrap();
            assert_eq!(address.scheme, scheme);
            assert_eq!(address.host, "example");
            assert_eq!(address.port, 1000);
        }
    }

    #[test]
    fn star_and_empty_hosts_normalize_to_all_interfaces() {
        let star: Address = "tcp://*:8000".parse().unwrap();
        assert_eq!(star.host, "");
        let empty: Address = "tcp://:8000".parse().unwrap();
        assert_eq!(empty.host, "");
    }

    #[test]
    fn ipv6_hosts_lose_their_brackets() {
        let address: Address = "tcp://[::1]:8000".parse().unwrap();
        assert_eq!(address.host, "::1");
    }

    #[test]
    fn port_boundaries() {
        assert!("tcp://h:1".parse::<Address>().is_ok());
        assert!("tcp://h:65535".parse::<Address>().is_ok());
        assert_eq!(
            "tcp://h:0".parse::<Address>(),
            Err(AddressError::InvalidPort("0".to_string()))
        );
        assert_eq!(
            "tcp://h:65536".parse::<Address>(),
            Err(AddressError::InvalidPort("65536".to_string()))
        );
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert_eq!(
            "example:1000".parse::<Address>(),
            Err(AddressError::MissingScheme)
        );
        assert_eq!(
            "udp://example:1000".parse::<Address>(),
            Err(AddressError::UnknownScheme("udp".to_string()))
        );
        assert_eq!(
            "tcp://example".parse::<Address>(),
            Err(AddressError::MissingPort)
        );
    }

    #[test]
    fn display_round_trips() {
        for input in ["tcp://example:1000", "wss://*:443"] {
            let address: Address = input.parse().unwrap();
            assert_eq!(address.to_string(), input);
        }
    }
}
