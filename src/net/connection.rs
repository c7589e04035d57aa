//! Per-connection identity, close requests and registry membership.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry graceful/forceful close requests from the registry to a connection task
//! - Remove a connection from its registry when the task ends

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::net::registry::{ConnectionHandle, ConnectionRegistry};

/// Relaxed ordering is enough, IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the registry last asked of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRequest {
    Open,
    /// Finish the close handshake, then disconnect.
    Graceful,
    /// Drop the transport now.
    Forceful,
}

/// Registry-side handle of one connection.
#[derive(Debug)]
pub struct ConnectionControl {
    id: ConnectionId,
    tx: watch::Sender<CloseRequest>,
}

impl ConnectionControl {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl ConnectionHandle for ConnectionControl {
    fn close_gracefully(&self) {
        let changed = self.tx.send_if_modified(|request| {
            if *request == CloseRequest::Open {
                *request = CloseRequest::Graceful;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(connection_id = %self.id, "Graceful close requested");
        }
    }

    fn close_forcefully(&self) {
        self.tx.send_replace(CloseRequest::Forceful);
        tracing::debug!(connection_id = %self.id, "Forceful close requested");
    }
}

/// Connection-side view of close requests.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<CloseRequest>,
}

impl CloseSignal {
    pub fn current(&self) -> CloseRequest {
        *self.rx.borrow()
    }

    /// Wait for the next close request.
    ///
    /// Never resolves once the registry side is gone.
    pub async fn changed(&mut self) -> CloseRequest {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }

    /// Resolve once a forceful close was requested.
    pub async fn forced(&mut self) {
        if self
            .rx
            .wait_for(|request| *request == CloseRequest::Forceful)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }
}

/// Create the two ends of a connection's close channel.
pub fn close_channel(id: ConnectionId) -> (ConnectionControl, CloseSignal) {
    let (tx, rx) = watch::channel(CloseRequest::Open);
    (ConnectionControl { id, tx }, CloseSignal { rx })
}

/// Registry membership of one connection. Removes it when dropped.
pub struct ConnectionGuard<H: ConnectionHandle> {
    registry: Arc<ConnectionRegistry<H>>,
    id: ConnectionId,
}

impl<H: ConnectionHandle> ConnectionGuard<H> {
    pub fn register(registry: Arc<ConnectionRegistry<H>>, id: ConnectionId, handle: H) -> Self {
        registry.add(id, handle);
        Self { registry, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl<H: ConnectionHandle> Drop for ConnectionGuard<H> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

impl<H: ConnectionHandle> std::fmt::Debug for ConnectionGuard<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard").field("id", &self.id).finish()
    }
}
