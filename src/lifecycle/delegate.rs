//! Capabilities the coordinator needs from a server.

use std::os::fd::RawFd;

use thiserror::Error;

use crate::net::registry::DrainHandle;

/// Errors returned when a server cannot start listening.
#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to adopt inherited listener fd {fd}: {source}")]
    Adopt {
        fd: RawFd,
        #[source]
        source: std::io::Error,
    },
}

/// The six operations the shutdown coordinator drives.
///
/// Every `DrainHandle` returned here resolves once the server has no open
/// connections left. Implementations treat unbinding an already-closed
/// listener as satisfied.
pub trait ServerDelegate: Send {
    /// Start accepting on an inherited, already-bound descriptor.
    fn start_accepting(&mut self, fd: RawFd) -> Result<(), DelegateError>;

    /// Bind a fresh listener on `port` and start accepting.
    fn start_server(&mut self, port: u16) -> Result<(), DelegateError>;

    /// Unbind without touching open connections.
    fn stop_accepting(&mut self) -> DrainHandle;

    /// Unbind and ask every connection to close its session.
    fn close_gracefully(&mut self) -> DrainHandle;

    /// Unbind and terminate every connection's transport.
    fn close_forcefully(&mut self) -> DrainHandle;

    fn report(&self) -> String;
}
