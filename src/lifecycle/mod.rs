//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Resolve activation → Claim control pipe → Build coordinator → Run
//!
//! Events (one mpsc channel):
//!     signals.rs       SIGTERM/SIGINT → Terminate, SIGHUP → Quiesce
//!     control reader   start_accepting / stop_accepting / shutdown
//!     drain deadline   DrainTimeout
//!
//! State machine (shutdown.rs):
//!     Standby → Accepting → [StopRequested] → GracefulDrain → ForcefulDrain → Stopped
//!                                                   └──────────────────────────┘
//! ```
//!
//! # Design Decisions
//! - The coordinator only sees the six delegate operations (delegate.rs)
//! - Drain completion is an awaited handle, not a callback
//! - The graceful drain has no deadline unless one is configured

pub mod delegate;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use delegate::{DelegateError, ServerDelegate};
pub use shutdown::{
    LifecycleError, LifecycleEvent, Shutdown, ShutdownCoordinator, ShutdownReport, ShutdownState,
    SupervisionMode,
};
pub use signals::spawn_signal_listener;
pub use startup::{spawn_control_reader, Service};
