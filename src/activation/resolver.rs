//! Discovery of inherited listening and control descriptors.
//!
//! # Responsibilities
//! - Read `LISTEN_FDS` / `LISTEN_PID` once and decide the listening source
//! - Mark inherited descriptors close-on-exec
//! - Remove consumed markers so a re-exec does not inherit them again
//! - Hand out the supervisor's control pipe at most once
//!
//! # Design Decisions
//! - Compat mode skips the `LISTEN_PID` check (supervisors that cannot know
//!   the child pid before exec)
//! - A pid mismatch or a zero count is not an error, it selects a fresh listen

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::activation::env::Environment;
use crate::activation::notify::NOTIFY_FD;

/// Count of inherited descriptors.
pub const LISTEN_FDS: &str = "LISTEN_FDS";
/// Pid the inherited descriptors are meant for.
pub const LISTEN_PID: &str = "LISTEN_PID";
/// First inherited descriptor (the first one above stdio).
pub const LISTEN_FDS_START: RawFd = 3;

/// Where the service gets its listening socket from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationSource {
    /// Adopt an already-bound listener passed down by the supervisor.
    Inherited(RawFd),
    /// Bind a new listener on this port.
    FreshListen(u16),
}

impl std::fmt::Display for ActivationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inherited(fd) => write!(f, "inherited fd {fd}"),
            Self::FreshListen(port) => write!(f, "fresh listen on port {port}"),
        }
    }
}

/// The supervisor's control pipe, owned by whoever claimed it.
#[derive(Debug)]
pub struct ControlEndpoints {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

#[derive(Debug)]
struct Resolution {
    source: ActivationSource,
    fds: Vec<RawFd>,
}

/// Resolves the activation source once per process and caches it.
pub struct ActivationResolver {
    env: Arc<dyn Environment>,
    listen_fds_start: RawFd,
    port: u16,
    resolved: OnceLock<Resolution>,
    control_claimed: AtomicBool,
}

impl ActivationResolver {
    /// `port` is used when nothing was inherited.
    pub fn new(env: Arc<dyn Environment>, listen_fds_start: RawFd, port: u16) -> Self {
        Self {
            env,
            listen_fds_start,
            port,
            resolved: OnceLock::new(),
            control_claimed: AtomicBool::new(false),
        }
    }

    /// Decide the listening source. Only the first call inspects the
    /// environment; later calls return the cached result.
    pub fn resolve(&self, compat_mode: bool) -> ActivationSource {
        self.resolved.get_or_init(|| self.compute(compat_mode)).source
    }

    /// The source, if [`resolve`](Self::resolve) already ran.
    pub fn source(&self) -> Option<ActivationSource> {
        self.resolved.get().map(|r| r.source)
    }

    /// Every inherited descriptor, in order. Empty for a fresh listen.
    pub fn inherited_fds(&self) -> &[RawFd] {
        self.resolved.get().map(|r| r.fds.as_slice()).unwrap_or(&[])
    }

    /// Claim the supervisor's control pipe.
    ///
    /// Only available when descriptors were inherited and both ends are open.
    /// Descriptors named by `NOTIFY_FD` belong to the notifier and are never
    /// claimed. Ownership is handed out once; later calls return `None`.
    pub fn control_endpoints(&self, read_fd: RawFd, write_fd: RawFd) -> Option<ControlEndpoints> {
        if !matches!(self.source(), Some(ActivationSource::Inherited(_))) {
            tracing::debug!("No inherited activation, control channel unavailable");
            return None;
        }

        if self.inherited_fds().contains(&read_fd) || self.inherited_fds().contains(&write_fd) {
            tracing::warn!(read_fd, write_fd, "Control descriptors overlap inherited listeners");
            return None;
        }

        let notify_fd = self.env.var(NOTIFY_FD).and_then(|v| v.trim().parse::<RawFd>().ok());
        if let Some(fd) = notify_fd.filter(|fd| *fd == read_fd || *fd == write_fd) {
            tracing::info!(notify_fd = fd, read_fd, write_fd, "Control descriptors overlap the notify descriptor");
            return None;
        }

        if !is_open(read_fd) || !is_open(write_fd) {
            tracing::debug!(read_fd, write_fd, "Control descriptors not open");
            return None;
        }

        if self.control_claimed.swap(true, Ordering::SeqCst) {
            tracing::warn!("Control descriptors already claimed");
            return None;
        }

        for fd in [read_fd, write_fd] {
            mark_cloexec(fd);
        }

        tracing::info!(read_fd, write_fd, "Supervisor control channel found");

        // SAFETY: both descriptors were checked open, are not among the
        // listening descriptors, and the swap above guarantees this is the
        // only place ownership is taken.
        let endpoints = unsafe {
            ControlEndpoints {
                read: OwnedFd::from_raw_fd(read_fd),
                write: OwnedFd::from_raw_fd(write_fd),
            }
        };
        Some(endpoints)
    }

    fn compute(&self, compat_mode: bool) -> Resolution {
        let fresh = Resolution {
            source: ActivationSource::FreshListen(self.port),
            fds: Vec::new(),
        };

        let count = self
            .env
            .var(LISTEN_FDS)
            .and_then(|v| v.trim().parse::<RawFd>().ok())
            .unwrap_or(0);
        if count <= 0 {
            tracing::debug!(port = self.port, "No inherited descriptors");
            return fresh;
        }

        if !compat_mode {
            let expected = self.env.var(LISTEN_PID).and_then(|v| v.trim().parse::<u32>().ok());
            if expected != Some(self.env.pid()) {
                tracing::debug!(
                    expected_pid = ?expected,
                    pid = self.env.pid(),
                    "LISTEN_PID does not match, ignoring inherited descriptors"
                );
                return fresh;
            }
        }

        let Some(end) = self.listen_fds_start.checked_add(count) else {
            tracing::warn!(count, "LISTEN_FDS out of range, ignoring inherited descriptors");
            return fresh;
        };

        self.env.remove_var(LISTEN_PID);
        self.env.remove_var(LISTEN_FDS);

        let fds: Vec<RawFd> = (self.listen_fds_start..end).collect();
        for fd in &fds {
            mark_cloexec(*fd);
        }

        tracing::info!(count, first_fd = self.listen_fds_start, "Inherited listening descriptors");

        Resolution {
            source: ActivationSource::Inherited(self.listen_fds_start),
            fds,
        }
    }
}

impl std::fmt::Debug for ActivationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationResolver")
            .field("listen_fds_start", &self.listen_fds_start)
            .field("port", &self.port)
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_open(fd: RawFd) -> bool {
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

pub(crate) fn mark_cloexec(fd: RawFd) {
    if let Err(err) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
        tracing::warn!(fd, error = %err, "Failed to mark descriptor close-on-exec");
    }
}
