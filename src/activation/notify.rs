//! Readiness, status and watchdog notifications to the supervisor.
//!
//! # Wire Format
//! One newline-free `KEY=value` line per message, sent as a single datagram
//! or write: `READY=1`, `STATUS=<text>`, `ERRNO=<n>`, `BUSERROR=<text>`,
//! `MAINPID=<pid>`, `WATCHDOG=1`, `STOPPING=1`.
//!
//! # Sink Resolution
//! Lazily, on first use:
//! 1. `NOTIFY_SOCKET`: path of a local socket (`@name` is the Linux abstract
//!    namespace); datagram first, stream as fallback
//! 2. `NOTIFY_FD`: an inherited, already-connected socket descriptor
//! 3. otherwise a null sink that discards everything
//!
//! Notifications are best-effort. Nothing here returns an error to callers.
//! Every sink is non-blocking: when the supervisor is not reading and the
//! socket buffer is full, the message is dropped and logged.

use std::io::{self, Write};
use std::os::fd::RawFd;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{send, MsgFlags};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::activation::env::Environment;
use crate::activation::resolver::{is_open, mark_cloexec};

pub const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";
/// Extension: inherited descriptor used when no socket path is given.
pub const NOTIFY_FD: &str = "NOTIFY_FD";
pub const WATCHDOG_PID: &str = "WATCHDOG_PID";
pub const WATCHDOG_USEC: &str = "WATCHDOG_USEC";

/// A notification to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyKind {
    Ready,
    Status(String),
    Errno(i32),
    BusError(String),
    MainPid(u32),
    Watchdog,
    Stopping,
}

impl NotifyKind {
    /// Render as a single sanitized `KEY=value` line.
    pub fn render(&self) -> String {
        let line = match self {
            Self::Ready => "READY=1".to_string(),
            Self::Status(msg) => format!("STATUS={msg}"),
            Self::Errno(n) => format!("ERRNO={n}"),
            Self::BusError(msg) => format!("BUSERROR={msg}"),
            Self::MainPid(pid) => format!("MAINPID={pid}"),
            Self::Watchdog => "WATCHDOG=1".to_string(),
            Self::Stopping => "STOPPING=1".to_string(),
        };
        sanitize(&line)
    }
}

fn sanitize(line: &str) -> String {
    line.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

/// Resolved notification destination.
#[derive(Debug)]
pub enum NotifySink {
    Datagram(UnixDatagram),
    Stream(UnixStream),
    /// Inherited socket descriptor (not owned; it lives for the process).
    Descriptor(RawFd),
    Null,
}

impl NotifySink {
    fn send(&self, message: &[u8]) -> io::Result<()> {
        match self {
            Self::Datagram(socket) => socket.send(message).map(|_| ()),
            Self::Stream(stream) => {
                let mut writer: &UnixStream = stream;
                writer.write_all(message)
            }
            Self::Descriptor(fd) => send(*fd, message, send_flags())
                .map(|_| ())
                .map_err(io::Error::from),
            Self::Null => Ok(()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    // No SIGPIPE when the supervisor end has gone away.
    MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_DONTWAIT
}

/// Notification state for one process: sink and watchdog settings,
/// each resolved once.
pub struct NotifyContext {
    env: Arc<dyn Environment>,
    sink: OnceLock<NotifySink>,
    watchdog: OnceLock<Option<Duration>>,
}

impl NotifyContext {
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self {
            env,
            sink: OnceLock::new(),
            watchdog: OnceLock::new(),
        }
    }

    /// Send one notification. Failures are logged and swallowed.
    pub fn notify(&self, kind: &NotifyKind) {
        let line = kind.render();
        match self.sink().send(line.as_bytes()) {
            Ok(()) => tracing::trace!(message = %line, "Supervisor notified"),
            Err(err) => tracing::debug!(message = %line, error = %err, "Supervisor notification failed"),
        }
    }

    /// The resolved sink, resolving it on first call.
    pub fn sink(&self) -> &NotifySink {
        self.sink.get_or_init(|| resolve_sink(self.env.as_ref()))
    }

    /// Whether the supervisor asked this process for watchdog pings.
    pub fn watchdog_enabled(&self) -> bool {
        self.watchdog_interval().is_some()
    }

    /// Interval the supervisor expects pings within, if the watchdog is on.
    pub fn watchdog_interval(&self) -> Option<Duration> {
        *self.watchdog.get_or_init(|| detect_watchdog(self.env.as_ref()))
    }
}

impl std::fmt::Debug for NotifyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyContext")
            .field("sink", &self.sink.get())
            .field("watchdog", &self.watchdog.get())
            .finish_non_exhaustive()
    }
}

fn resolve_sink(env: &dyn Environment) -> NotifySink {
    if let Some(path) = env.var(NOTIFY_SOCKET) {
        env.remove_var(NOTIFY_SOCKET);
        return match connect_path(&path) {
            Ok(sink) => {
                tracing::debug!(path = %path, "Notify socket connected");
                sink
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "Notify socket unusable, notifications disabled");
                NotifySink::Null
            }
        };
    }

    if let Some(raw) = env.var(NOTIFY_FD) {
        env.remove_var(NOTIFY_FD);
        return match raw.trim().parse::<RawFd>() {
            Ok(fd) if is_open(fd) => {
                mark_cloexec(fd);
                tracing::debug!(fd, "Notify descriptor inherited");
                NotifySink::Descriptor(fd)
            }
            _ => {
                tracing::warn!(value = %raw, "NOTIFY_FD unusable, notifications disabled");
                NotifySink::Null
            }
        };
    }

    NotifySink::Null
}

fn connect_path(path: &str) -> io::Result<NotifySink> {
    let datagram = UnixDatagram::unbound()?;
    match connect_datagram(&datagram, path) {
        Ok(()) => {
            datagram.set_nonblocking(true)?;
            Ok(NotifySink::Datagram(datagram))
        }
        Err(err) if err.raw_os_error() == Some(Errno::EPROTOTYPE as i32) => {
            let stream = UnixStream::connect(path)?;
            stream.set_nonblocking(true)?;
            Ok(NotifySink::Stream(stream))
        }
        Err(err) => Err(err),
    }
}

#[cfg(target_os = "linux")]
fn connect_datagram(socket: &UnixDatagram, path: &str) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    match path.strip_prefix('@') {
        Some(name) => socket.connect_addr(&SocketAddr::from_abstract_name(name)?),
        None => socket.connect(path),
    }
}

#[cfg(not(target_os = "linux"))]
fn connect_datagram(socket: &UnixDatagram, path: &str) -> io::Result<()> {
    socket.connect(path)
}

fn detect_watchdog(env: &dyn Environment) -> Option<Duration> {
    let pid = env.var(WATCHDOG_PID);
    let usec = env.var(WATCHDOG_USEC);
    env.remove_var(WATCHDOG_PID);
    env.remove_var(WATCHDOG_USEC);

    let pid_matches = pid.and_then(|v| v.trim().parse::<u32>().ok()) == Some(env.pid());
    let usec = usec.and_then(|v| v.trim().parse::<u64>().ok()).filter(|u| *u > 0);

    match (pid_matches, usec) {
        (true, Some(usec)) => {
            let interval = Duration::from_micros(usec);
            tracing::info!(interval_ms = interval.as_millis() as u64, "Watchdog enabled");
            Some(interval)
        }
        _ => None,
    }
}

/// Ping `WATCHDOG=1` at half the requested interval until shutdown.
///
/// Returns `None` when the supervisor did not ask for a watchdog.
pub fn spawn_watchdog(
    context: Arc<NotifyContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>> {
    let interval = context.watchdog_interval()?;
    let period = (interval / 2).max(Duration::from_millis(1));

    Some(tokio::spawn(async move {
        let mut ticker = time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => context.notify(&NotifyKind::Watchdog),
                _ = shutdown.recv() => {
                    tracing::debug!("Watchdog stopping");
                    break;
                }
            }
        }
    }))
}
