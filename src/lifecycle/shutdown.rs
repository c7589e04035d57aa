//! Shutdown coordination.
//!
//! # Responsibilities
//! - Own the process-wide [`ShutdownState`] and its transitions
//! - Translate termination, quiesce and supervisor commands into delegate calls
//! - Escalate a graceful drain to a forceful one on a second termination
//!   request or when the optional drain timeout elapses
//! - Announce transitions to the supervisor and the readiness notifier
//!
//! # Design Decisions
//! - `handle` is a synchronous transition function; `run` is the only place
//!   that awaits, so transitions never interleave
//! - Supervisor messages are queued during a transition and flushed by `run`
//! - Reaching `Stopped` triggers [`Shutdown`] exactly once

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::activation::{ActivationSource, NotifyContext, NotifyKind};
use crate::lifecycle::delegate::{DelegateError, ServerDelegate};
use crate::net::registry::{DrainHandle, DrainOutcome};
use crate::protocol::message::{commands, ControlMessage};
use crate::protocol::ControlSender;

/// Broadcast fired once when the service has stopped.
///
/// Long-running tasks (watchdog pings, the control reader) subscribe to it.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Not bound yet; waiting for the supervisor's `start_accepting`.
    Standby,
    Accepting,
    /// Unbound, existing connections left alone.
    StopRequested,
    GracefulDrain,
    ForcefulDrain,
    Stopped,
}

impl ShutdownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::Accepting => "accepting",
            Self::StopRequested => "stop_requested",
            Self::GracefulDrain => "graceful_drain",
            Self::ForcefulDrain => "forceful_drain",
            Self::Stopped => "stopped",
        }
    }

    fn is_draining(&self) -> bool {
        matches!(self, Self::GracefulDrain | Self::ForcefulDrain)
    }
}

impl std::fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the coordinator's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// SIGINT/SIGTERM or a supervisor `shutdown`.
    Terminate,
    /// SIGHUP or a supervisor `stop_accepting`.
    Quiesce,
    /// Any other supervisor command.
    Control(ControlMessage),
    /// The graceful drain deadline elapsed.
    DrainTimeout,
}

/// Whether a supervisor drives the start of accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionMode {
    Unsupervised,
    Supervised,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Delegate(#[from] DelegateError),

    #[error("lifecycle event channel closed in state {0}")]
    EventsClosed(ShutdownState),
}

/// Summary returned by [`ShutdownCoordinator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub final_state: ShutdownState,
    /// A forceful drain was needed.
    pub escalated: bool,
    pub connections: String,
}

#[derive(Debug)]
struct PendingDrain {
    handle: DrainHandle,
    phase: ShutdownState,
}

/// Drives a [`ServerDelegate`] through the lifecycle state machine.
pub struct ShutdownCoordinator<D> {
    delegate: D,
    source: ActivationSource,
    state: ShutdownState,
    control: Option<ControlSender>,
    outbox: Vec<ControlMessage>,
    notifier: Option<Arc<NotifyContext>>,
    status_updates: bool,
    drain_timeout: Option<Duration>,
    drain_deadline: Option<Instant>,
    pending: Option<PendingDrain>,
    escalated: bool,
    shutdown: Shutdown,
}

impl<D: ServerDelegate> ShutdownCoordinator<D> {
    pub fn new(delegate: D, source: ActivationSource) -> Self {
        Self {
            delegate,
            source,
            state: ShutdownState::Standby,
            control: None,
            outbox: Vec::new(),
            notifier: None,
            status_updates: false,
            drain_timeout: None,
            drain_deadline: None,
            pending: None,
            escalated: false,
            shutdown: Shutdown::new(),
        }
    }

    /// Run supervised: wait for `start_accepting` and report over `sender`.
    pub fn with_control(mut self, sender: ControlSender) -> Self {
        self.control = Some(sender);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<NotifyContext>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Send `MAINPID=` and `STATUS=` besides the lifecycle keys.
    ///
    /// Off by default: only `READY=1` and `STOPPING=1` are sent, one write each.
    pub fn with_status_updates(mut self, enabled: bool) -> Self {
        self.status_updates = enabled;
        self
    }

    /// Escalate a graceful drain that has not finished after `timeout`.
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn mode(&self) -> SupervisionMode {
        if self.control.is_some() {
            SupervisionMode::Supervised
        } else {
            SupervisionMode::Unsupervised
        }
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Supervisor messages queued since the last flush.
    pub fn outbox(&self) -> &[ControlMessage] {
        &self.outbox
    }

    /// Initialise: start accepting now, or announce readiness to the
    /// supervisor and wait for its command.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        if self.state != ShutdownState::Standby {
            return Ok(());
        }

        match self.mode() {
            SupervisionMode::Unsupervised => self.start_accepting(),
            SupervisionMode::Supervised => {
                tracing::info!(source = %self.source, "Waiting for supervisor");
                self.queue(commands::READY, json!({ "pid": std::process::id() }));
                self.announce_ready();
                self.status("waiting for supervisor".to_string());
                Ok(())
            }
        }
    }

    /// Bind the activation source. A no-op unless in `Standby`.
    pub fn start_accepting(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            ShutdownState::Standby => {}
            ShutdownState::Accepting => {
                tracing::debug!("Already accepting");
                return Ok(());
            }
            state => {
                tracing::warn!(state = %state, "Ignoring start_accepting after shutdown began");
                return Ok(());
            }
        }

        match self.source {
            ActivationSource::Inherited(fd) => self.delegate.start_accepting(fd)?,
            ActivationSource::FreshListen(port) => self.delegate.start_server(port)?,
        }

        self.transition(ShutdownState::Accepting);
        self.queue(commands::ACCEPTING, json!({ "source": self.source.to_string() }));
        if self.mode() == SupervisionMode::Unsupervised {
            self.announce_ready();
        }
        Ok(())
    }

    /// Apply one event.
    pub fn handle(&mut self, event: LifecycleEvent) -> Result<(), LifecycleError> {
        tracing::debug!(state = %self.state, event = ?event, "Lifecycle event");

        match event {
            LifecycleEvent::Terminate => self.terminate(),
            LifecycleEvent::Quiesce => self.quiesce(),
            LifecycleEvent::DrainTimeout => {
                if self.state == ShutdownState::GracefulDrain {
                    tracing::warn!(
                        timeout_secs = self.drain_timeout.map(|t| t.as_secs_f64()),
                        "Graceful drain timed out"
                    );
                    self.begin_forceful();
                }
            }
            LifecycleEvent::Control(message) => return self.handle_command(message),
        }
        Ok(())
    }

    /// Check the pending drain without waiting.
    ///
    /// Returns `true` if a drain completed.
    pub fn poll_drained(&mut self) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        match pending.handle.try_outcome() {
            Some(outcome) => {
                self.on_drained(outcome);
                true
            }
            None => false,
        }
    }

    /// Start, then process events until `Stopped`.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<LifecycleEvent>,
    ) -> Result<ShutdownReport, LifecycleError> {
        self.start()?;
        self.flush().await;

        let mut events_open = true;
        while self.state != ShutdownState::Stopped {
            if !events_open && self.pending.is_none() {
                return Err(LifecycleError::EventsClosed(self.state));
            }

            let deadline = self.drain_deadline;
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle(event)?,
                    None => {
                        tracing::debug!("Lifecycle event channel closed");
                        events_open = false;
                    }
                },
                outcome = async {
                    match self.pending.as_mut() {
                        Some(pending) => (&mut pending.handle).await,
                        None => std::future::pending().await,
                    }
                } => self.on_drained(outcome),
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.drain_deadline = None;
                    self.handle(LifecycleEvent::DrainTimeout)?;
                }
            }

            self.flush().await;
        }

        Ok(self.report())
    }

    /// Send queued supervisor messages. Failures are logged.
    pub async fn flush(&mut self) {
        let outbox = std::mem::take(&mut self.outbox);
        let Some(control) = self.control.as_ref() else {
            return;
        };
        for message in &outbox {
            if let Err(err) = control.send_message(message).await {
                tracing::warn!(command = %message.command, error = %err, "Failed to notify supervisor");
            }
        }
    }

    pub fn report(&self) -> ShutdownReport {
        ShutdownReport {
            final_state: self.state,
            escalated: self.escalated,
            connections: self.delegate.report(),
        }
    }

    fn handle_command(&mut self, message: ControlMessage) -> Result<(), LifecycleError> {
        match message.command.as_str() {
            commands::START_ACCEPTING => self.start_accepting(),
            commands::STOP_ACCEPTING => {
                self.quiesce();
                Ok(())
            }
            commands::SHUTDOWN => {
                self.terminate();
                Ok(())
            }
            other => {
                tracing::warn!(command = other, "Unknown supervisor command");
                Ok(())
            }
        }
    }

    fn terminate(&mut self) {
        match self.state {
            ShutdownState::Standby | ShutdownState::Accepting | ShutdownState::StopRequested => {
                self.begin_graceful()
            }
            ShutdownState::GracefulDrain => self.begin_forceful(),
            ShutdownState::ForcefulDrain => {
                tracing::warn!(connections = %self.delegate.report(), "Already closing forcefully");
            }
            ShutdownState::Stopped => tracing::debug!("Already stopped"),
        }
    }

    fn quiesce(&mut self) {
        if self.state != ShutdownState::Accepting {
            tracing::debug!(state = %self.state, "Ignoring stop accepting");
            return;
        }
        let handle = self.delegate.stop_accepting();
        self.transition(ShutdownState::StopRequested);
        self.arm(handle);
    }

    fn begin_graceful(&mut self) {
        tracing::info!(connections = %self.delegate.report(), "Closing gracefully");
        let handle = self.delegate.close_gracefully();
        self.transition(ShutdownState::GracefulDrain);
        self.queue(commands::STOPPING, json!({ "mode": "graceful" }));
        self.notify(NotifyKind::Stopping);
        self.drain_deadline = self.drain_timeout.map(|timeout| Instant::now() + timeout);
        self.arm(handle);
    }

    fn begin_forceful(&mut self) {
        tracing::info!(connections = %self.delegate.report(), "Closing forcefully");
        let handle = self.delegate.close_forcefully();
        self.escalated = true;
        self.drain_deadline = None;
        self.transition(ShutdownState::ForcefulDrain);
        self.queue(commands::STOPPING, json!({ "mode": "forceful" }));
        self.arm(handle);
    }

    fn arm(&mut self, handle: DrainHandle) {
        self.pending = Some(PendingDrain {
            handle,
            phase: self.state,
        });
    }

    fn on_drained(&mut self, outcome: DrainOutcome) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if outcome == DrainOutcome::Superseded {
            tracing::debug!(phase = %pending.phase, "Drain completion superseded");
            return;
        }

        match self.state {
            ShutdownState::StopRequested => {
                tracing::info!("Stopped accepting and no connections remain");
                self.queue(commands::DRAINED, Value::Object(Map::new()));
                self.status("stopped accepting, no open connections".to_string());
            }
            state if state.is_draining() => {
                self.transition(ShutdownState::Stopped);
                self.drain_deadline = None;
                self.shutdown.trigger();
            }
            state => {
                tracing::debug!(state = %state, phase = %pending.phase, "Ignoring stale drain completion");
            }
        }
    }

    fn transition(&mut self, next: ShutdownState) {
        tracing::info!(from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        if self.status_updates {
            self.status(format!("{next}; {}", self.delegate.report()));
        }
    }

    fn announce_ready(&self) {
        self.notify(NotifyKind::Ready);
        if self.status_updates {
            self.notify(NotifyKind::MainPid(std::process::id()));
        }
    }

    fn status(&self, text: String) {
        if self.status_updates {
            self.notify(NotifyKind::Status(text));
        }
    }

    fn queue(&mut self, command: &str, args: Value) {
        if self.control.is_none() {
            return;
        }
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.outbox.push(ControlMessage::with_args(command, args));
    }

    fn notify(&self, kind: NotifyKind) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(&kind);
        }
    }
}

impl<D> std::fmt::Debug for ShutdownCoordinator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("source", &self.source)
            .field("state", &self.state)
            .field("supervised", &self.control.is_some())
            .field("escalated", &self.escalated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use crate::net::registry::{ConnectionHandle, ConnectionRegistry, DrainMode};
    use crate::protocol::ControlChannel;
    use std::os::fd::RawFd;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        log: Mutex<Vec<String>>,
    }

    impl Calls {
        fn push(&self, call: impl Into<String>) {
            self.log.lock().unwrap().push(call.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    struct Noop;

    impl ConnectionHandle for Noop {
        fn close_gracefully(&self) {}
        fn close_forcefully(&self) {}
    }

    struct FakeServer {
        calls: Arc<Calls>,
        registry: Arc<ConnectionRegistry<Noop>>,
    }

    impl ServerDelegate for FakeServer {
        fn start_accepting(&mut self, fd: RawFd) -> Result<(), DelegateError> {
            self.calls.push(format!("start_accepting({fd})"));
            Ok(())
        }

        fn start_server(&mut self, port: u16) -> Result<(), DelegateError> {
            self.calls.push(format!("start_server({port})"));
            Ok(())
        }

        fn stop_accepting(&mut self) -> DrainHandle {
            self.calls.push("stop_accepting");
            self.registry.arm()
        }

        fn close_gracefully(&mut self) -> DrainHandle {
            self.calls.push("close_gracefully");
            self.registry.drain(DrainMode::Graceful)
        }

        fn close_forcefully(&mut self) -> DrainHandle {
            self.calls.push("close_forcefully");
            self.registry.drain(DrainMode::Forceful)
        }

        fn report(&self) -> String {
            self.registry.report()
        }
    }

    fn coordinator(
        source: ActivationSource,
        open: usize,
    ) -> (
        ShutdownCoordinator<FakeServer>,
        Arc<Calls>,
        Arc<ConnectionRegistry<Noop>>,
        Vec<ConnectionId>,
    ) {
        let calls = Arc::new(Calls::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let ids: Vec<_> = (0..open).map(|_| ConnectionId::next()).collect();
        for id in &ids {
            registry.add(*id, Noop);
        }
        let server = FakeServer {
            calls: Arc::clone(&calls),
            registry: Arc::clone(&registry),
        };
        (ShutdownCoordinator::new(server, source), calls, registry, ids)
    }

    #[test]
    fn unsupervised_start_binds_once() {
        let (mut coordinator, calls, _, _) = coordinator(ActivationSource::FreshListen(8000), 0);

        coordinator.start().unwrap();
        coordinator.start_accepting().unwrap();
        coordinator.start().unwrap();

        assert_eq!(coordinator.state(), ShutdownState::Accepting);
        assert_eq!(calls.take(), vec!["start_server(8000)"]);
    }

    #[test]
    fn inherited_source_is_adopted() {
        let (mut coordinator, calls, _, _) = coordinator(ActivationSource::Inherited(3), 0);
        coordinator.start().unwrap();
        assert_eq!(calls.take(), vec!["start_accepting(3)"]);
    }

    #[test]
    fn two_terminations_escalate_once() {
        let (mut coordinator, calls, registry, ids) = coordinator(ActivationSource::FreshListen(8000), 2);
        coordinator.start().unwrap();
        calls.take();

        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::GracefulDrain);
        assert!(!coordinator.poll_drained());

        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::ForcefulDrain);

        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        assert_eq!(calls.take(), vec!["close_gracefully", "close_forcefully"]);

        let mut stopped = coordinator.subscribe();
        registry.remove(ids[0]);
        assert!(!coordinator.poll_drained());
        registry.remove(ids[1]);
        assert!(coordinator.poll_drained());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert!(stopped.try_recv().is_ok());
        assert!(!coordinator.poll_drained());

        let report = coordinator.report();
        assert!(report.escalated);
        assert_eq!(report.connections, "Connections open: 0");
    }

    #[test]
    fn terminate_with_no_connections_stops_immediately() {
        let (mut coordinator, _, _, _) = coordinator(ActivationSource::FreshListen(8000), 0);
        coordinator.start().unwrap();

        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        assert!(coordinator.poll_drained());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert!(!coordinator.report().escalated);
    }

    #[test]
    fn quiesce_keeps_connections_until_termination() {
        let (mut coordinator, calls, registry, ids) = coordinator(ActivationSource::FreshListen(8000), 1);
        coordinator.start().unwrap();
        calls.take();

        coordinator.handle(LifecycleEvent::Quiesce).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::StopRequested);
        assert_eq!(calls.take(), vec!["stop_accepting"]);

        coordinator.handle(LifecycleEvent::Quiesce).unwrap();
        assert!(calls.take().is_empty());

        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::GracefulDrain);
        assert_eq!(calls.take(), vec!["close_gracefully"]);

        registry.remove(ids[0]);
        assert!(coordinator.poll_drained());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[test]
    fn quiesce_completion_keeps_state() {
        let (mut coordinator, _, registry, ids) = coordinator(ActivationSource::FreshListen(8000), 1);
        coordinator.start().unwrap();
        coordinator.handle(LifecycleEvent::Quiesce).unwrap();

        registry.remove(ids[0]);
        assert!(coordinator.poll_drained());
        assert_eq!(coordinator.state(), ShutdownState::StopRequested);
    }

    #[test]
    fn drain_timeout_escalates_only_from_graceful() {
        let (mut coordinator, calls, _, _) = coordinator(ActivationSource::FreshListen(8000), 1);
        coordinator.start().unwrap();
        calls.take();

        coordinator.handle(LifecycleEvent::DrainTimeout).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Accepting);

        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        coordinator.handle(LifecycleEvent::DrainTimeout).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::ForcefulDrain);
        assert_eq!(calls.take(), vec!["close_gracefully", "close_forcefully"]);
    }

    #[test]
    fn supervised_waits_for_start_command() {
        let (mut coordinator, calls, _, _) = coordinator(ActivationSource::Inherited(3), 0);
        let channel = ControlChannel::new(tokio::io::empty(), tokio::io::sink());
        coordinator = coordinator.with_control(channel.sender());

        coordinator.start().unwrap();
        assert_eq!(coordinator.mode(), SupervisionMode::Supervised);
        assert_eq!(coordinator.state(), ShutdownState::Standby);
        assert!(calls.take().is_empty());
        assert_eq!(coordinator.outbox()[0].command, commands::READY);

        let start = LifecycleEvent::Control(ControlMessage::new(commands::START_ACCEPTING));
        coordinator.handle(start.clone()).unwrap();
        coordinator.handle(start).unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Accepting);
        assert_eq!(calls.take(), vec!["start_accepting(3)"]);

        let sent: Vec<_> = coordinator.outbox().iter().map(|m| m.command.as_str()).collect();
        assert_eq!(sent, vec![commands::READY, commands::ACCEPTING]);
    }

    #[test]
    fn unsupervised_queues_nothing() {
        let (mut coordinator, _, _, _) = coordinator(ActivationSource::FreshListen(8000), 0);
        coordinator.start().unwrap();
        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        assert!(coordinator.outbox().is_empty());
    }

    fn notify_pair() -> (Arc<NotifyContext>, std::os::unix::net::UnixStream) {
        use crate::activation::notify::NOTIFY_FD;
        use crate::activation::MapEnv;
        use std::os::fd::IntoRawFd;

        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        let env = MapEnv::new(std::process::id()).with_var(NOTIFY_FD, ours.into_raw_fd().to_string());
        (Arc::new(NotifyContext::new(Arc::new(env))), theirs)
    }

    fn drain_stream(stream: &mut std::os::unix::net::UnixStream) -> String {
        use std::io::Read;

        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => panic!("notify read failed: {err}"),
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn stream_notifier_sees_only_lifecycle_keys() {
        let (notifier, mut supervisor) = notify_pair();
        let (coordinator, _, _, _) = coordinator(ActivationSource::FreshListen(8000), 0);
        let mut coordinator = coordinator.with_notifier(notifier);

        coordinator.start().unwrap();
        assert_eq!(drain_stream(&mut supervisor), "READY=1");

        coordinator.handle(LifecycleEvent::Terminate).unwrap();
        assert!(coordinator.poll_drained());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert_eq!(drain_stream(&mut supervisor), "STOPPING=1");
    }

    #[test]
    fn status_updates_are_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let supervisor = std::os::unix::net::UnixDatagram::bind(&path).unwrap();
        supervisor.set_nonblocking(true).unwrap();

        let env = crate::activation::MapEnv::new(std::process::id())
            .with_var(crate::activation::notify::NOTIFY_SOCKET, path.to_string_lossy());
        let notifier = Arc::new(NotifyContext::new(Arc::new(env)));
        let (coordinator, _, _, _) = coordinator(ActivationSource::FreshListen(8000), 0);
        let mut coordinator = coordinator.with_notifier(notifier).with_status_updates(true);
        coordinator.start().unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 128];
        while let Ok(n) = supervisor.recv(&mut buf) {
            seen.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        assert_eq!(
            seen,
            vec![
                "STATUS=accepting; Connections open: 0".to_string(),
                "READY=1".to_string(),
                format!("MAINPID={}", std::process::id()),
            ]
        );
    }

    #[tokio::test]
    async fn run_reports_stopped_after_drain() {
        let (coordinator, _, registry, ids) = coordinator(ActivationSource::FreshListen(8000), 1);
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(coordinator.run(rx));
        tx.send(LifecycleEvent::Terminate).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.remove(ids[0]);

        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.final_state, ShutdownState::Stopped);
        assert!(!report.escalated);
    }

    #[tokio::test]
    async fn run_escalates_on_drain_timeout() {
        let (coordinator, calls, registry, ids) = coordinator(ActivationSource::FreshListen(8000), 1);
        let coordinator = coordinator.with_drain_timeout(Some(Duration::from_millis(30)));
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(coordinator.run(rx));
        tx.send(LifecycleEvent::Terminate).await.unwrap();

        for _ in 0..200 {
            if calls.log.lock().unwrap().iter().any(|c| c == "close_forcefully") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.remove(ids[0]);

        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.escalated);
        assert_eq!(
            calls.take(),
            vec!["start_server(8000)", "close_gracefully", "close_forcefully"]
        );
    }

    #[tokio::test]
    async fn run_fails_when_events_close_while_idle() {
        let (coordinator, _, _, _) = coordinator(ActivationSource::FreshListen(8000), 0);
        let (tx, rx) = mpsc::channel(1);
        drop(tx);

        let err = coordinator.run(rx).await.unwrap_err();
        assert!(matches!(err, LifecycleError::EventsClosed(ShutdownState::Accepting)));
    }

    #[test]
    fn shutdown_triggers_once() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
