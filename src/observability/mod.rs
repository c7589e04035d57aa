//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (connection_id, state, fd, ...)
//!     → logging.rs (filter + fmt/json layer to stderr)
//!
//! Supervisor-facing status goes through activation::notify instead.
//! ```

pub mod logging;

pub use logging::init_logging;
