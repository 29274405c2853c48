//! The command-line interface: a top-level role (`master`, `slave`, or
//! `version`), a direction per role (`listen` or `connect`), one positional
//! transport address, and per-role flags.
//!
//! Argument types parse through [`FromStr`] so that malformed values are
//! rejected by the parser itself; cross-flag rules that the parser cannot
//! express (a key without `--ssl`, a PTY without a program) are collected by
//! [`validate`][master::Listen::validate] and reported all at once.

pub mod master;
pub mod slave;

use {structopt::StructOpt, thiserror::Error};

#[derive(Debug, StructOpt)]
#[structopt(name = "zeekat", about = "SSH-style remote control over TCP, WebSocket, and TLS")]
pub enum Cli {
    /// Drive a remote peer: shell, port forwards, and SOCKS proxy
    Master(master::Cli),
    /// Serve a master: execute programs and dial targets on its behalf
    Slave(slave::Cli),
    /// Print version information
    Version,
}

impl Cli {
    /// Whether `--verbose` was given, regardless of role and direction.
    pub fn verbose(&self) -> bool {
        match self {
            Cli::Master(master::Cli::Listen(cmd)) => cmd.common.verbose,
            Cli::Master(master::Cli::Connect(cmd)) => cmd.common.verbose,
            Cli::Slave(slave::Cli::Listen(cmd)) => cmd.common.verbose,
            Cli::Slave(slave::Cli::Connect(cmd)) => cmd.common.verbose,
            Cli::Version => false,
        }
    }
}

/// Flags shared by every role and direction.
#[derive(Debug, Clone, StructOpt)]
pub struct CommonOpts {
    /// Wrap the session in TLS
    #[structopt(short = "s", long = "ssl")]
    pub ssl: bool,
    /// Pre-shared key for mutually authenticated TLS (requires --ssl)
    #[structopt(short = "k", long = "key")]
    pub key: Option<String>,
    /// Log at debug level
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
    /// Connect timeout in milliseconds; 0 uses the OS default
    #[structopt(long = "timeout", default_value = "0")]
    pub timeout: u64,
}

/// A configuration rule the flag parser cannot enforce on its own.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("--key requires --ssl")]
    KeyWithoutSsl,
    #[error("--pty requires --exec")]
    PtyWithoutExec,
    #[error("--pty is only supported on unix")]
    PtyUnsupported,
    #[error("connect requires a host")]
    ConnectWithoutHost,
}

/// Render aggregated configuration errors as the bulleted list printed
/// before a startup exit.
pub fn render_errors(errors: &[ConfigError]) -> String {
    let mut out = String::from("invalid configuration:");
    for error in errors {
        out.push_str("\n  - ");
        out.push_str(&error.to_string());
    }
    out
}

pub(crate) fn common_rules(common: &CommonOpts, connecting: bool, host: &str) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    if common.key.is_some() && !common.ssl {
        errors.push(ConfigError::KeyWithoutSsl);
    }
    if connecting && host.is_empty() {
        errors.push(ConfigError::ConnectWithoutHost);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use structopt::StructOpt;

    #[test]
    fn parses_master_listen() {
        let cli = Cli::from_iter(["zeekat", "master", "listen", "tcp://*:4444", "--exec", "sh"]);
        match cli {
            Cli::Master(master::Cli::Listen(listen)) => {
                assert_eq!(listen.address.port, 4444);
                assert_eq!(listen.address.host, "");
                assert_eq!(listen.features.exec.as_deref(), Some("sh"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_repeated_forwards() {
        let cli = Cli::from_iter([
            "zeekat",
            "master",
            "connect",
            "tcp://127.0.0.1:4444",
            "-L",
            "9999:127.0.0.1:8888",
            "-L",
            "127.0.0.1:7777:db:5432",
            "--socks",
            "1080",
        ]);
        match cli {
            Cli::Master(master::Cli::Connect(connect)) => {
                assert_eq!(connect.features.local.len(), 2);
                assert_eq!(connect.features.socks.as_ref().unwrap().port, 1080);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_slave_cleanup_flag() {
        let cli = Cli::from_iter(["zeekat", "slave", "connect", "ws://peer:80", "-c"]);
        match cli {
            Cli::Slave(slave::Cli::Connect(connect)) => assert!(connect.cleanup),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn key_without_ssl_is_rejected() {
        let cli = Cli::from_iter([
            "zeekat", "master", "listen", "tcp://*:4444", "--key", "secret",
        ]);
        let Cli::Master(master::Cli::Listen(listen)) = cli else {
            panic!("unexpected parse");
        };
        assert!(listen.validate().contains(&ConfigError::KeyWithoutSsl));
    }

    #[test]
    fn pty_without_exec_is_rejected() {
        let cli = Cli::from_iter(["zeekat", "master", "listen", "tcp://*:4444", "--pty"]);
        let Cli::Master(master::Cli::Listen(listen)) = cli else {
            panic!("unexpected parse");
        };
        assert!(listen.validate().contains(&ConfigError::PtyWithoutExec));
    }

    #[test]
    fn connect_requires_a_host() {
        let cli = Cli::from_iter(["zeekat", "slave", "connect", "tcp://*:4444"]);
        let Cli::Slave(slave::Cli::Connect(connect)) = cli else {
            panic!("unexpected parse");
        };
        assert!(connect.validate().contains(&ConfigError::ConnectWithoutHost));
    }

    #[test]
    fn errors_render_as_bulleted_list() {
        let rendered = render_errors(&[ConfigError::KeyWithoutSsl, ConfigError::PtyWithoutExec]);
        assert!(rendered.contains("\n  - --key requires --ssl"));
        assert!(rendered.contains("\n  - --pty requires --exec"));
    }
}
