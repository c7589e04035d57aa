//! Open-connection registry with a single-slot "now empty" signal.
//!
//! # Responsibilities
//! - Track every open connection handle from accept to close
//! - Issue graceful or forceful close actions to all of them
//! - Signal, exactly once, when the set becomes empty after a drain was armed
//!
//! # Design Decisions
//! - The completion slot holds one `oneshot` sender; a later drain replaces
//!   it (last writer wins) and the earlier waiter observes `Superseded`
//! - The sender is taken under the lock, so concurrent removals cannot
//!   complete a drain twice
//! - Close actions run outside the lock; a handle may remove itself
//!   synchronously from inside its close action

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::net::connection::ConnectionId;

/// How open connections are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Ask each connection to finish its close handshake and disconnect.
    Graceful,
    /// Terminate each connection's transport immediately.
    Forceful,
}

impl std::fmt::Display for DrainMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::Forceful => f.write_str("forceful"),
        }
    }
}

/// Close actions the registry can issue to a connection.
pub trait ConnectionHandle: Send + Sync {
    fn close_gracefully(&self);
    fn close_forcefully(&self);
}

/// How a [`DrainHandle`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The registry became empty.
    Drained,
    /// A later drain took over the completion slot.
    Superseded,
}

/// Single-shot completion of a drain.
#[derive(Debug)]
pub struct DrainHandle {
    rx: oneshot::Receiver<()>,
}

impl DrainHandle {
    /// Non-blocking check; `None` while connections are still open.
    pub fn try_outcome(&mut self) -> Option<DrainOutcome> {
        match self.rx.try_recv() {
            Ok(()) => Some(DrainOutcome::Drained),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(DrainOutcome::Superseded),
        }
    }
}

impl Future for DrainHandle {
    type Output = DrainOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => DrainOutcome::Superseded,
        })
    }
}

struct Inner<H> {
    open: HashMap<ConnectionId, Arc<H>>,
    on_empty: Option<oneshot::Sender<()>>,
}

/// Set of open connections.
pub struct ConnectionRegistry<H> {
    inner: Mutex<Inner<H>>,
}

impl<H: ConnectionHandle> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                open: HashMap::new(),
                on_empty: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a newly accepted connection.
    ///
    /// Callers guarantee each id is added once.
    pub fn add(&self, id: ConnectionId, handle: H) {
        let open = {
            let mut inner = self.lock();
            let previous = inner.open.insert(id, Arc::new(handle));
            if previous.is_some() {
                tracing::error!(connection_id = %id, "Connection registered twice");
                debug_assert!(previous.is_none(), "connection {id} registered twice");
            }
            inner.open.len()
        };
        tracing::debug!(connection_id = %id, open, "Connection added");
    }

    /// Forget a closed connection, completing an armed drain if it was the last.
    ///
    /// Callers guarantee each id is removed once.
    pub fn remove(&self, id: ConnectionId) {
        let (open, fire) = {
            let mut inner = self.lock();
            if inner.open.remove(&id).is_none() {
                tracing::error!(connection_id = %id, "Removing unknown connection");
                debug_assert!(false, "connection {id} removed twice or never added");
                return;
            }
            let fire = if inner.open.is_empty() { inner.on_empty.take() } else { None };
            (inner.open.len(), fire)
        };

        tracing::debug!(connection_id = %id, open, "Connection removed");

        if let Some(tx) = fire {
            tracing::info!("All connections closed");
            let _ = tx.send(());
        }
    }

    /// Close every open connection, then arm the completion slot.
    pub fn drain(&self, mode: DrainMode) -> DrainHandle {
        let handles: Vec<Arc<H>> = self.lock().open.values().cloned().collect();

        tracing::info!(mode = %mode, connections = handles.len(), "Draining connections");
        for handle in &handles {
            match mode {
                DrainMode::Graceful => handle.close_gracefully(),
                DrainMode::Forceful => handle.close_forcefully(),
            }
        }

        self.arm()
    }

    /// Arm the completion slot without closing anything.
    ///
    /// Resolves immediately when nothing is open.
    pub fn arm(&self) -> DrainHandle {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if inner.open.is_empty() {
            drop(inner);
            let _ = tx.send(());
        } else if inner.on_empty.replace(tx).is_some() {
            tracing::debug!("Pending drain completion superseded");
        }
        DrainHandle { rx }
    }

    /// Run `f` against one open connection's handle, outside the lock.
    pub fn with_handle<R>(&self, id: ConnectionId, f: impl FnOnce(&H) -> R) -> Option<R> {
        let handle = self.lock().open.get(&id).cloned();
        handle.map(|handle| f(&handle))
    }

    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().open.is_empty()
    }

    /// Human-readable open-connection count.
    pub fn report(&self) -> String {
        format!("Connections open: {}", self.len())
    }
}

impl<H: ConnectionHandle> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> std::fmt::Debug for ConnectionRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.inner.lock().map(|i| i.open.len()).unwrap_or_default();
        f.debug_struct("ConnectionRegistry").field("open", &open).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        graceful: AtomicUsize,
        forceful: AtomicUsize,
    }

    impl ConnectionHandle for Arc<Counting> {
        fn close_gracefully(&self) {
            self.graceful.fetch_add(1, Ordering::SeqCst);
        }

        fn close_forcefully(&self) {
            self.forceful.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry_with(n: usize) -> (ConnectionRegistry<Arc<Counting>>, Vec<ConnectionId>, Arc<Counting>) {
        let registry = ConnectionRegistry::new();
        let counts = Arc::new(Counting::default());
        let ids: Vec<_> = (0..n).map(|_| ConnectionId::next()).collect();
        for id in &ids {
            registry.add(*id, Arc::clone(&counts));
        }
        (registry, ids, counts)
    }

    #[test]
    fn forceful_drain_fires_after_last_removal() {
        let (registry, ids, counts) = registry_with(2);

        let mut handle = registry.drain(DrainMode::Forceful);
        assert_eq!(counts.forceful.load(Ordering::SeqCst), 2);
        assert_eq!(counts.graceful.load(Ordering::SeqCst), 0);

        registry.remove(ids[0]);
        assert_eq!(handle.try_outcome(), None);

        registry.remove(ids[1]);
        assert_eq!(handle.try_outcome(), Some(DrainOutcome::Drained));
    }

    #[test]
    fn drain_on_empty_registry_completes_immediately() {
        let registry: ConnectionRegistry<Arc<Counting>> = ConnectionRegistry::new();
        let mut handle = registry.drain(DrainMode::Graceful);
        assert_eq!(handle.try_outcome(), Some(DrainOutcome::Drained));
    }

    #[test]
    fn later_drain_supersedes_earlier_slot() {
        let (registry, ids, counts) = registry_with(1);

        let mut graceful = registry.drain(DrainMode::Graceful);
        let mut forceful = registry.drain(DrainMode::Forceful);
        assert_eq!(counts.graceful.load(Ordering::SeqCst), 1);
        assert_eq!(counts.forceful.load(Ordering::SeqCst), 1);
        assert_eq!(graceful.try_outcome(), Some(DrainOutcome::Superseded));

        registry.remove(ids[0]);
        assert_eq!(forceful.try_outcome(), Some(DrainOutcome::Drained));
    }

    #[test]
    fn slot_is_only_armed_by_drain_or_arm() {
        let (registry, ids, _) = registry_with(1);
        registry.remove(ids[0]);

        // Becoming empty with nothing armed completes nothing; a later arm
        // on the empty set resolves at once.
        registry.add(ids[0], Arc::new(Counting::default()));
        let mut handle = registry.arm();
        assert_eq!(handle.try_outcome(), None);
        registry.remove(ids[0]);
        assert_eq!(handle.try_outcome(), Some(DrainOutcome::Drained));
    }

    #[test]
    fn adds_after_drain_delay_completion() {
        let (registry, ids, counts) = registry_with(1);
        let mut handle = registry.drain(DrainMode::Graceful);

        let late = ConnectionId::next();
        registry.add(late, Arc::clone(&counts));
        registry.remove(ids[0]);
        assert_eq!(handle.try_outcome(), None);

        registry.remove(late);
        assert_eq!(handle.try_outcome(), Some(DrainOutcome::Drained));
    }

    #[test]
    fn concurrent_removals_complete_once() {
        let (registry, ids, _) = registry_with(64);
        let registry = Arc::new(registry);
        let handle = registry.drain(DrainMode::Forceful);

        let threads: Vec<_> = ids
            .chunks(8)
            .map(|chunk| {
                let registry = Arc::clone(&registry);
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for id in chunk {
                        registry.remove(id);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(registry.is_empty());
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert_eq!(rt.block_on(handle), DrainOutcome::Drained);
    }

    #[test]
    fn report_counts_open_connections() {
        let (registry, ids, _) = registry_with(3);
        assert_eq!(registry.report(), "Connections open: 3");
        registry.remove(ids[1]);
        assert_eq!(registry.report(), "Connections open: 2");
        assert_eq!(registry.len(), 2);
    }
}
