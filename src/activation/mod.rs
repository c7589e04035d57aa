//! Socket activation and supervisor notification.
//!
//! # Data Flow
//! ```text
//! Process environment (read once, markers removed)
//!     → resolver.rs: LISTEN_FDS / LISTEN_PID
//!         → ActivationSource::Inherited(fd) | ActivationSource::FreshListen(port)
//!         → ControlEndpoints (inherited supervisor pipe, if any)
//!     → notify.rs: NOTIFY_SOCKET / NOTIFY_FD / WATCHDOG_PID / WATCHDOG_USEC
//!         → NotifySink (datagram, stream, descriptor or null)
//! ```
//!
//! # Design Decisions
//! - Results are memoized in explicit context values built at startup,
//!   not in process-wide globals
//! - Environment access goes through [`Environment`] so tests never touch
//!   the real process environment
//! - Missing or mismatched markers are not errors; they select the fallback

pub mod env;
pub mod notify;
pub mod resolver;

pub use env::{Environment, MapEnv, ProcessEnv};
pub use notify::{spawn_watchdog, NotifyContext, NotifyKind, NotifySink};
pub use resolver::{ActivationResolver, ActivationSource, ControlEndpoints, LISTEN_FDS_START};
