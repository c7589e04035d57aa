//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGTERM, SIGINT and SIGHUP handlers
//! - Translate each delivery into a [`LifecycleEvent`] on the coordinator's channel
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Every SIGTERM/SIGINT is forwarded; the coordinator decides whether it
//!   escalates or is ignored
//! - SIGHUP stops accepting without draining

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::LifecycleEvent;

/// Map a signal kind to the event it drives.
pub fn event_for(kind: SignalKind) -> Option<LifecycleEvent> {
    if kind == SignalKind::interrupt() || kind == SignalKind::terminate() {
        Some(LifecycleEvent::Terminate)
    } else if kind == SignalKind::hangup() {
        Some(LifecycleEvent::Quiesce)
    } else {
        None
    }
}

/// Install the handlers and forward deliveries to `tx`.
///
/// The task ends once the receiving side is dropped.
pub fn spawn_signal_listener(tx: mpsc::Sender<LifecycleEvent>) -> std::io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let (name, kind) = tokio::select! {
                Some(()) = interrupt.recv() => ("SIGINT", SignalKind::interrupt()),
                Some(()) = terminate.recv() => ("SIGTERM", SignalKind::terminate()),
                Some(()) = hangup.recv() => ("SIGHUP", SignalKind::hangup()),
                else => break,
            };

            let Some(event) = event_for(kind) else {
                continue;
            };
            tracing::info!(signal = name, event = ?event, "Signal received");

            if tx.send(event).await.is_err() {
                tracing::debug!("Lifecycle loop gone, signal listener exiting");
                break;
            }
        }
    }))
}
