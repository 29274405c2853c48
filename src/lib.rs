//! An SSH-style remote control tool over pluggable transports.
//!
//! Two peers establish a single connection (TCP, WebSocket, or
//! WebSocket-over-TLS, optionally wrapped in TLS keyed by a shared secret)
//! and the *master* drives an interactive shell, PTY, port forwards, and a
//! SOCKS5 proxy on the *slave* over a multiplexed session.
//!
//! The crate splits role-first: [`master`] and [`slave`] compose the four
//! entrypoint flows (role by direction) out of the shared layers underneath
//! them: [`transport`] (dial/listen and TLS), [`protocol`] (the control
//! handshake and stream sub-protocols), and [`session`] (stream multiplexing
//! and job supervision).

pub mod cleanup;
pub mod cli;
pub mod config;
pub mod defaults;
pub mod master;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod slave;
pub mod terminal;
pub mod transport;

#[cfg(unix)]
pub mod pty;
