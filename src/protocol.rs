//! The wire protocol spoken between master and slave: the control-channel
//! handshake, per-stream header lines, PTY resize frames, and the SOCKS5
//! constants shared by both peers.
//!
//! Everything here is deliberately small and symmetric: a frame is a 4-byte
//! big-endian length followed by that many bytes of UTF-8 JSON, and a stream
//! header is a single newline-terminated ASCII line written by whichever
//! peer opened the stream.

use {
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::{
        fmt::{self, Display},
        io,
        str::FromStr,
    },
    thiserror::Error,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use crate::defaults;

/// The single control-channel message, sent master to slave immediately
/// after the (optional) TLS handshake and before the multiplexer starts.
///
/// It describes every feature the master wants for the session; the slave
/// installs the corresponding handlers and then accepts the main stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Program for the slave to execute, or empty for plain stdio bridging.
    #[serde(default)]
    pub exec: String,
    /// Whether the slave should allocate a PTY for the executed program.
    #[serde(default)]
    pub pty: bool,
    /// Whether the master wants a log-tee stream.
    #[serde(default)]
    pub log: bool,
    /// Listeners the master binds; targets the slave dials.
    #[serde(default)]
    pub local_forwards: Vec<ForwardSpec>,
    /// Listeners the slave binds; targets the master dials.
    #[serde(default)]
    pub remote_forwards: Vec<ForwardSpec>,
    /// SOCKS5 listener the master binds, with targets dialed by the slave.
    #[serde(default)]
    pub socks: Option<SocksSpec>,
}

/// A port forwarding rule: a listener on one peer, a dial target on the
/// other. Which peer binds depends on whether the spec was given with
/// `--local` or `--remote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    /// Host to bind; empty means all interfaces.
    pub bind_host: String,
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardSpec {
    /// The `host:port` string to bind the listener on.
    pub fn bind_addr(&self) -> String {
        format_addr(&self.bind_host, self.bind_port)
    }

    /// The `host:port` string naming the dial target.
    pub fn target_addr(&self) -> String {
        format_addr(&self.target_host, self.target_port)
    }
}

/// Join host and port, defaulting an empty host to all interfaces and
/// bracketing bare IPv6 literals.
pub fn format_addr(host: &str, port: u16) -> String {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpecError {
    #[error("expected 3 or 4 colon-separated fields, got {0}")]
    FieldCount(usize),
    #[error("invalid port `{0}`: expected a number in 1..=65535")]
    InvalidPort(String),
    #[error("target host may not be empty")]
    EmptyTargetHost,
}

fn parse_port(field: &str) -> Result<u16, SpecError> {
    match field.parse::<u16>() {
        Ok(0) | Err(_) => Err(SpecError::InvalidPort(field.to_string())),
        Ok(port) => Ok(port),
    }
}

impl FromStr for ForwardSpec {
    type Err = SpecError;

    /// Parse `[bind-host:]bind-port:target-host:target-port`; a missing
    /// bind host means all interfaces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let (bind_host, bind_port, target_host, target_port) = match fields.as_slice() {
            [bind_port, target_host, target_port] => ("", *bind_port, *target_host, *target_port),
            [bind_host, bind_port, target_host, target_port] => {
                (*bind_host, *bind_port, *target_host, *target_port)
            }
            other => return Err(SpecError::FieldCount(other.len())),
        };
        if target_host.is_empty() {
            return Err(SpecError::EmptyTargetHost);
        }
        Ok(ForwardSpec {
            bind_host: bind_host.to_string(),
            bind_port: parse_port(bind_port)?,
            target_host: target_host.to_string(),
            target_port: parse_port(target_port)?,
        })
    }
}

impl Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.bind_host, self.bind_port, self.target_host, self.target_port
        )
    }
}

/// Where the master binds its SOCKS5 listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksSpec {
    /// Host to bind; empty means all interfaces.
    pub host: String,
    pub port: u16,
}

impl SocksSpec {
    pub fn bind_addr(&self) -> String {
        format_addr(&self.host, self.port)
    }
}

impl FromStr for SocksSpec {
    type Err = SpecError;

    /// Parse `[bind-host:]bind-port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let (host, port) = match fields.as_slice() {
            [port] => ("", *port),
            [host, port] => (*host, *port),
            other => return Err(SpecError::FieldCount(other.len())),
        };
        Ok(SocksSpec {
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }
}

impl Display for SocksSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A PTY window-size update, framed like the handshake on its own stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {1}-byte limit")]
    FrameTooLong(usize, usize),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("stream header exceeds {0} bytes")]
    HeaderTooLong(usize),
    #[error("malformed stream header `{0}`")]
    MalformedHeader(String),
    #[error("unexpected stream header `{0}`")]
    UnexpectedHeader(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Serialize `message` and write it as one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > defaults::max_frame_length() {
        return Err(ProtocolError::FrameTooLong(
            body.len(),
            defaults::max_frame_length(),
        ));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and deserialize it.
///
/// Reads exactly the frame and nothing more: once the handshake frame has
/// been consumed, every following byte on the connection belongs to the
/// multiplexer.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > defaults::max_frame_length() {
        return Err(ProtocolError::FrameTooLong(
            len,
            defaults::max_frame_length(),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// The first line written on every on-demand stream, identifying its
/// sub-protocol and dial target to the accepting peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamHeader {
    /// Master accepted a local connection; slave dials the target.
    LocalForward { host: String, port: u16 },
    /// Slave accepted a remote connection; master dials the target.
    RemoteForward { host: String, port: u16 },
    /// Master accepted a SOCKS5 CONNECT; slave dials the target.
    Socks { host: String, port: u16 },
}

impl StreamHeader {
    pub fn target_addr(&self) -> String {
        let (StreamHeader::LocalForward { host, port }
        | StreamHeader::RemoteForward { host, port }
        | StreamHeader::Socks { host, port }) = self;
        format_addr(host, *port)
    }
}

impl Display for StreamHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamHeader::LocalForward { host, port } => {
                write!(f, "local-forward {}:{}", host, port)
            }
            StreamHeader::RemoteForward { host, port } => {
                write!(f, "remote-forward {}:{}", host, port)
            }
            StreamHeader::Socks { host, port } => write!(f, "socks {}:{}", host, port),
        }
    }
}

impl FromStr for StreamHeader {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::MalformedHeader(line.to_string());
        let (kind, target) = line.split_once(' ').ok_or_else(malformed)?;
        let (host, port) = target.rsplit_once(':').ok_or_else(malformed)?;
        let port = port.parse::<u16>().map_err(|_| malformed())?;
        if port == 0 {
            return Err(malformed());
        }
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        match kind {
            "local-forward" => Ok(StreamHeader::LocalForward { host, port }),
            "remote-forward" => Ok(StreamHeader::RemoteForward { host, port }),
            "socks" => Ok(StreamHeader::Socks { host, port }),
            _ => Err(malformed()),
        }
    }
}

/// Write a stream header line, newline-terminated.
pub async fn write_header<W>(writer: &mut W, header: &StreamHeader) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{}\n", header);
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a stream header line.
///
/// Reads one byte at a time on purpose: payload bytes may follow the
/// newline immediately, and a buffered reader would swallow them.
pub async fn read_header<R>(reader: &mut R) -> Result<StreamHeader, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() >= defaults::max_header_length() {
            return Err(ProtocolError::HeaderTooLong(defaults::max_header_length()));
        }
    }
    let line = String::from_utf8(line)
        .map_err(|e| ProtocolError::MalformedHeader(String::from_utf8_lossy(e.as_bytes()).into()))?;
    line.parse()
}

/// SOCKS5 (RFC 1928) constants and the one-byte dial status relayed from
/// slave to master on socks streams.
pub mod socks {
    use std::io;

    pub const VERSION: u8 = 0x05;
    pub const METHOD_NO_AUTH: u8 = 0x00;
    pub const METHOD_UNACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CONNECTION_REFUSED: u8 = 0x05;
    pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

    /// Map a dial failure to the reply code the SOCKS client should see.
    /// The same byte doubles as the slave-to-master status preamble on
    /// socks streams.
    pub fn reply_for_dial_error(error: &io::Error) -> u8 {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
            io::ErrorKind::HostUnreachable => REP_HOST_UNREACHABLE,
            io::ErrorKind::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
            _ => REP_GENERAL_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> Handshake {
        Handshake {
            exec: "sh".to_string(),
            pty: true,
            log: false,
            local_forwards: vec!["9999:127.0.0.1:8888".parse().unwrap()],
            remote_forwards: vec!["0.0.0.0:7777:intranet:80".parse().unwrap()],
            socks: Some("1080".parse().unwrap()),
        }
    }

    #[test]
    fn handshake_round_trips() {
        let sent = handshake();
        let json = serde_json::to_vec(&sent).unwrap();
        let received: Handshake = serde_json::from_slice(&json).unwrap();
        assert_eq!(sent, received);
    }

    #[test]
    fn handshake_defaults_missing_fields() {
        let received: Handshake = serde_json::from_str("{}").unwrap();
        assert_eq!(received.exec, "");
        assert!(!received.pty);
        assert!(received.local_forwards.is_empty());
        assert!(received.socks.is_none());
    }

    #[test]
    fn forward_spec_parses_three_fields() {
        let spec: ForwardSpec = "9999:127.0.0.1:8888".parse().unwrap();
        assert_eq!(spec.bind_host, "");
        assert_eq!(spec.bind_port, 9999);
        assert_eq!(spec.target_host, "127.0.0.1");
        assert_eq!(spec.target_port, 8888);
    }

    #[test]
    fn forward_spec_parses_four_fields() {
        let spec: ForwardSpec = "127.0.0.1:9999:db:5432".parse().unwrap();
        assert_eq!(spec.bind_host, "127.0.0.1");
        assert_eq!(spec.target_host, "db");
    }

    #[test]
    fn forward_spec_rejects_other_field_counts() {
        assert!("8080".parse::<ForwardSpec>().is_err());
        assert!("a:1:b:2:c".parse::<ForwardSpec>().is_err());
    }

    #[test]
    fn forward_spec_rejects_bad_ports() {
        assert!("0:host:80".parse::<ForwardSpec>().is_err());
        assert!("65536:host:80".parse::<ForwardSpec>().is_err());
        assert!("1:host:80".parse::<ForwardSpec>().is_ok());
        assert!("65535:host:80".parse::<ForwardSpec>().is_ok());
    }

    #[test]
    fn socks_spec_parses_with_and_without_host() {
        let spec: SocksSpec = "1080".parse().unwrap();
        assert_eq!(spec.host, "");
        assert_eq!(spec.port, 1080);
        let spec: SocksSpec = "127.0.0.1:1080".parse().unwrap();
        assert_eq!(spec.host, "127.0.0.1");
    }

    #[test]
    fn stream_headers_round_trip() {
        for header in [
            StreamHeader::LocalForward {
                host: "127.0.0.1".to_string(),
                port: 8888,
            },
            StreamHeader::RemoteForward {
                host: "intranet".to_string(),
                port: 80,
            },
            StreamHeader::Socks {
                host: "example".to_string(),
                port: 443,
            },
        ] {
            let parsed: StreamHeader = header.to_string().parse().unwrap();
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn stream_header_rejects_garbage() {
        assert!("telnet example:80".parse::<StreamHeader>().is_err());
        assert!("socks example".parse::<StreamHeader>().is_err());
        assert!("socks example:0".parse::<StreamHeader>().is_err());
        assert!("".parse::<StreamHeader>().is_err());
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let sent = handshake();
        write_frame(&mut a, &sent).await.unwrap();
        let received: Handshake = read_frame(&mut b).await.unwrap();
        assert_eq!(sent, received);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (defaults::max_frame_length() as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        let result = read_frame::<_, Handshake>(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLong(..))));
    }

    #[tokio::test]
    async fn header_read_stops_at_newline() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"socks example:80\nPAYLOAD")
            .await
            .unwrap();
        let header = read_header(&mut b).await.unwrap();
        assert_eq!(
            header,
            StreamHeader::Socks {
                host: "example".to_string(),
                port: 80,
            }
        );
        let mut rest = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut rest).await.unwrap();
        assert_eq!(&rest, b"PAYLOAD");
    }

    #[tokio::test]
    async fn resize_frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let sent = Resize { rows: 48, cols: 132 };
        write_frame(&mut a, &sent).await.unwrap();
        let received: Resize = read_frame(&mut b).await.unwrap();
        assert_eq!(sent, received);
    }
}
