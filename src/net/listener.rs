//! TCP server adapter driven by the shutdown coordinator.
//!
//! # Responsibilities
//! - Adopt an inherited listening descriptor or bind a fresh one
//! - Accept connections and register each into the connection registry
//! - Stop accepting on request, swallowing accept errors caused by the stop
//! - Issue graceful/forceful drains through the registry

use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activation::resolver::is_open;
use crate::lifecycle::delegate::{DelegateError, ServerDelegate};
use crate::net::connection::{close_channel, CloseSignal, ConnectionControl, ConnectionGuard, ConnectionId};
use crate::net::registry::{ConnectionHandle, ConnectionRegistry, DrainHandle, DrainMode};

/// Pause after an accept error that was not caused by stopping.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Per-connection behaviour of a [`TcpServer`].
///
/// The handler owns the stream and should watch its [`CloseSignal`] for a
/// graceful close request. A forceful close drops the handler future.
pub type ConnectionHandler =
    Arc<dyn Fn(TcpStream, SocketAddr, CloseSignal) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async function as a [`ConnectionHandler`].
pub fn connection_handler<F, Fut>(f: F) -> ConnectionHandler
where
    F: Fn(TcpStream, SocketAddr, CloseSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream, peer, signal| Box::pin(f(stream, peer, signal)))
}

struct AcceptLoop {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    _task: JoinHandle<()>,
}

/// Tokio TCP implementation of [`ServerDelegate`].
pub struct TcpServer {
    host: String,
    handler: ConnectionHandler,
    registry: Arc<ConnectionRegistry<ConnectionControl>>,
    accepting: Option<AcceptLoop>,
}

impl TcpServer {
    /// `host` is used by [`start_server`](ServerDelegate::start_server).
    pub fn new(host: impl Into<String>, handler: ConnectionHandler) -> Self {
        Self {
            host: host.into(),
            handler,
            registry: Arc::new(ConnectionRegistry::new()),
            accepting: None,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry<ConnectionControl>> {
        Arc::clone(&self.registry)
    }

    /// Address of the live listener, if accepting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.accepting.as_ref().map(|a| a.local_addr)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.is_some()
    }

    fn listen(&mut self, std_listener: std::net::TcpListener) -> std::io::Result<()> {
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            cancel.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
        ));

        tracing::info!(address = %local_addr, "Accepting connections");

        self.accepting = Some(AcceptLoop {
            cancel,
            local_addr,
            _task: task,
        });
        Ok(())
    }

    fn unbind(&mut self) {
        match self.accepting.take() {
            Some(accepting) => {
                accepting.cancel.cancel();
                tracing::info!(address = %accepting.local_addr, "Listener unbound");
            }
            None => tracing::debug!("Listener already closed"),
        }
    }
}

impl ServerDelegate for TcpServer {
    fn start_accepting(&mut self, fd: RawFd) -> Result<(), DelegateError> {
        if self.is_accepting() {
            tracing::debug!(fd, "Already accepting, ignoring adopt request");
            return Ok(());
        }
        if !is_open(fd) {
            return Err(DelegateError::Adopt {
                fd,
                source: nix::errno::Errno::EBADF.into(),
            });
        }

        // SAFETY: the descriptor is open and was handed to this process by
        // the supervisor for exactly this listener; nothing else owns it.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        self.listen(std_listener)
            .map_err(|source| DelegateError::Adopt { fd, source })
    }

    fn start_server(&mut self, port: u16) -> Result<(), DelegateError> {
        if self.is_accepting() {
            tracing::debug!(port, "Already accepting, ignoring bind request");
            return Ok(());
        }

        let std_listener = std::net::TcpListener::bind((self.host.as_str(), port))
            .map_err(|source| DelegateError::Bind { port, source })?;
        self.listen(std_listener)
            .map_err(|source| DelegateError::Bind { port, source })
    }

    fn stop_accepting(&mut self) -> DrainHandle {
        self.unbind();
        self.registry.arm()
    }

    fn close_gracefully(&mut self) -> DrainHandle {
        self.unbind();
        self.registry.drain(DrainMode::Graceful)
    }

    fn close_forcefully(&mut self) -> DrainHandle {
        self.unbind();
        self.registry.drain(DrainMode::Forceful)
    }

    fn report(&self) -> String {
        self.registry.report()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(accepting) = self.accepting.take() {
            accepting.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("host", &self.host)
            .field("local_addr", &self.local_addr())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry<ConnectionControl>>,
    handler: ConnectionHandler,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) if cancel.is_cancelled() => {
                tracing::debug!(error = %err, "Accept failed after stop, ignoring");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let id = ConnectionId::next();
        let (control, signal) = close_channel(id);
        let guard = ConnectionGuard::register(Arc::clone(&registry), id, control);

        // Accepted concurrently with a stop: the drain may have missed it.
        if cancel.is_cancelled() {
            registry.with_handle(id, |control| control.close_gracefully());
        }

        tracing::debug!(connection_id = %id, peer_addr = %peer, "Connection accepted");

        let handler = Arc::clone(&handler);
        let mut forced = signal.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = handler(stream, peer, signal) => {}
                _ = forced.forced() => {
                    tracing::debug!(connection_id = %id, "Connection terminated");
                }
            }
        });
    }

    drop(listener);
    tracing::debug!("Accept loop stopped");
}
