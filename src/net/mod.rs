//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listening source (inherited fd or fresh bind)
//!     → listener.rs (TcpServer accept loop, cancellable)
//!     → connection.rs (ConnectionId, close channel, registry guard)
//!     → registry.rs (open set, drain + single-slot completion)
//!     → Hand off to the injected ConnectionHandler
//!
//! Close requests:
//!     Open → Graceful → Forceful
//! ```
//!
//! # Design Decisions
//! - The registry is the only shared state; the accept loop and the
//!   connection tasks touch it through guards
//! - A forceful close drops the handler future, which closes the transport
//! - Unbinding an already-closed listener is a no-op

pub mod connection;
pub mod listener;
pub mod registry;

pub use connection::{close_channel, CloseRequest, CloseSignal, ConnectionControl, ConnectionGuard, ConnectionId};
pub use listener::{connection_handler, ConnectionHandler, TcpServer};
pub use registry::{ConnectionHandle, ConnectionRegistry, DrainHandle, DrainMode, DrainOutcome};
