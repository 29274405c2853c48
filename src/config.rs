//! Immutable per-session configuration, assembled from the command line
//! before any connection is made.

use {
    rand::RngCore,
    std::{path::PathBuf, time::Duration},
};

use crate::{
    protocol::{ForwardSpec, Handshake, SocksSpec},
    transport::{Address, Scheme},
};

/// Configuration shared by both roles: where to connect or bind, and how
/// the connection is secured.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scheme: Scheme,
    /// Host to dial, or to bind (empty = all interfaces).
    pub host: String,
    pub port: u16,
    /// Whether to wrap the session in TLS.
    pub ssl: bool,
    /// Pre-shared key for mutually authenticated TLS; empty means no key.
    pub key: String,
    pub verbose: bool,
    /// Connect timeout; `None` leaves the OS default in place.
    pub connect_timeout: Option<Duration>,
    /// Short random identifier carried in log spans.
    pub session_id: String,
}

impl SessionConfig {
    pub fn new(address: Address, ssl: bool, key: String, verbose: bool, timeout_ms: u64) -> Self {
        SessionConfig {
            scheme: address.scheme,
            host: address.host,
            port: address.port,
            ssl,
            key,
            verbose,
            connect_timeout: match timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            session_id: session_id(),
        }
    }

    /// Whether the session TLS layer uses the derived mutual-auth material.
    pub fn keyed(&self) -> bool {
        self.ssl && !self.key.is_empty()
    }
}

/// Features the master requests for the session. The slave has no
/// equivalent: it learns everything from the wire handshake.
#[derive(Debug, Clone, Default)]
pub struct MasterConfig {
    pub exec: Option<String>,
    pub pty: bool,
    pub log: Option<PathBuf>,
    pub local_forwards: Vec<ForwardSpec>,
    pub remote_forwards: Vec<ForwardSpec>,
    pub socks: Option<SocksSpec>,
}

impl MasterConfig {
    /// The handshake message announcing these features to the slave.
    pub fn handshake(&self) -> Handshake {
        Handshake {
            exec: self.exec.clone().unwrap_or_default(),
            pty: self.pty,
            log: self.log.is_some(),
            local_forwards: self.local_forwards.clone(),
            remote_forwards: self.remote_forwards.clone(),
            socks: self.socks.clone(),
        }
    }
}

/// Eight random bytes, hex-encoded. Unique enough to tell interleaved
/// session logs apart.
fn session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
