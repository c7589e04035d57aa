//! Zero-downtime listener handoff.
//!
//! A worker adopts a listening socket inherited from its supervisor (or binds
//! a fresh one), reports readiness, accepts connections and, on request,
//! hands the listener back by draining gracefully and then forcefully.
//!
//! # Architecture Overview
//!
//! ```text
//!   supervisor ── fds 3,4,5 + env ──▶ activation (resolver, notify)
//!        ▲                                   │
//!        │ framed JSON (protocol)            ▼
//!        └──────────────────────── lifecycle (coordinator) ◀── signals
//!                                            │
//!                                            ▼ ServerDelegate
//!                                    net (TcpServer, registry)
//! ```

// Core subsystems
pub mod activation;
pub mod net;
pub mod protocol;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use activation::{ActivationResolver, ActivationSource, NotifyContext, NotifyKind};
pub use config::HandoffConfig;
pub use lifecycle::{LifecycleEvent, Service, ServerDelegate, ShutdownCoordinator, ShutdownState};
pub use net::{ConnectionRegistry, DrainMode, DrainOutcome, TcpServer};
pub use protocol::{ControlChannel, ControlMessage, Frame, FrameCodec};
