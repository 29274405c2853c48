//! The session layer: stream multiplexing over one connection, job
//! supervision, and the byte pumps the feature handlers share.

pub mod mux;
pub mod pipe;
pub mod supervisor;

pub use mux::{IncomingStreams, Mode, MuxError, Opener, Session, Stream};
pub use supervisor::{Supervisor, SupervisorError};
