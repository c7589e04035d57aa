//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve the activation source and the readiness notifier from the environment
//! - Claim the supervisor's control pipe when one was passed down
//! - Assemble the shutdown coordinator around a server delegate
//! - Start background tasks (control reader, watchdog) and run the lifecycle loop
//!
//! # Design Decisions
//! - Resolution happens once, here, and the results are passed down explicitly
//! - A missing control pipe degrades to unsupervised mode, it is not an error
//! - Background tasks stop when the coordinator reaches `Stopped`

use std::sync::Arc;

use tokio::net::unix::pipe;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::activation::{spawn_watchdog, ActivationResolver, ActivationSource, Environment, NotifyContext};
use crate::config::HandoffConfig;
use crate::lifecycle::delegate::ServerDelegate;
use crate::lifecycle::shutdown::{LifecycleError, LifecycleEvent, ShutdownCoordinator, ShutdownReport};
use crate::protocol::{ControlChannel, ControlMessage, ProtocolError};

/// Capacity of the lifecycle event channel.
const EVENT_QUEUE: usize = 32;

/// A fully wired service, ready to run.
pub struct Service<D> {
    coordinator: ShutdownCoordinator<D>,
    resolver: ActivationResolver,
    notifier: Arc<NotifyContext>,
    control: Option<ControlChannel<pipe::Receiver>>,
    watchdog: bool,
    events_tx: mpsc::Sender<LifecycleEvent>,
    events_rx: mpsc::Receiver<LifecycleEvent>,
}

impl<D: ServerDelegate + 'static> Service<D> {
    /// Wire the service from configuration. Must be called from within a
    /// runtime, since the control pipe registers with the reactor.
    pub fn prepare(config: &HandoffConfig, env: Arc<dyn Environment>, delegate: D) -> Self {
        let resolver = ActivationResolver::new(
            Arc::clone(&env),
            config.activation.listen_fds_start,
            config.listener.port,
        );
        let source = resolver.resolve(config.activation.compat_mode);
        tracing::info!(source = %source, "Activation resolved");

        let notifier = Arc::new(NotifyContext::new(env));

        let control = if config.control.enabled {
            let endpoints = resolver.control_endpoints(config.control.read_fd, config.control.write_fd);
            if endpoints.is_none() {
                tracing::info!("No supervisor control channel, running unsupervised");
            }
            endpoints.and_then(|e| match ControlChannel::from_inherited(e, config.control.max_frame_bytes) {
                Ok(channel) => Some(channel),
                Err(err) => {
                    tracing::warn!(error = %err, "Control descriptors are not a usable pipe, running unsupervised");
                    None
                }
            })
        } else {
            None
        };

        let mut coordinator = ShutdownCoordinator::new(delegate, source)
            .with_notifier(Arc::clone(&notifier))
            .with_drain_timeout(config.shutdown.drain_timeout())
            .with_status_updates(config.notify.status_updates);
        if let Some(channel) = &control {
            coordinator = coordinator.with_control(channel.sender());
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        Self {
            coordinator,
            resolver,
            notifier,
            control,
            watchdog: config.notify.watchdog,
            events_tx,
            events_rx,
        }
    }

    /// Sender for injecting lifecycle events (signals, tests).
    pub fn events(&self) -> mpsc::Sender<LifecycleEvent> {
        self.events_tx.clone()
    }

    pub fn source(&self) -> Option<ActivationSource> {
        self.resolver.source()
    }

    pub fn notifier(&self) -> Arc<NotifyContext> {
        Arc::clone(&self.notifier)
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator<D> {
        &self.coordinator
    }

    /// Run until the coordinator reaches `Stopped`.
    pub async fn run(self) -> Result<ShutdownReport, LifecycleError> {
        let Self {
            coordinator,
            notifier,
            control,
            watchdog,
            events_tx,
            events_rx,
            ..
        } = self;

        if let Some(channel) = control {
            if let Err(err) = spawn_control_reader(channel, events_tx.clone(), coordinator.subscribe()) {
                tracing::error!(error = %err, "Control reader not started");
            }
        }

        if watchdog {
            spawn_watchdog(notifier, coordinator.subscribe());
        }

        drop(events_tx);
        let report = coordinator.run(events_rx).await?;
        tracing::info!(
            state = %report.final_state,
            escalated = report.escalated,
            connections = %report.connections,
            "Shutdown complete"
        );
        Ok(report)
    }
}

/// Forward supervisor commands into the lifecycle loop until EOF or stop.
///
/// Fails if `channel` already has a command handler.
pub fn spawn_control_reader(
    mut channel: ControlChannel<pipe::Receiver>,
    events: mpsc::Sender<LifecycleEvent>,
    mut stopped: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>, ProtocolError> {
    channel.on_command(move |message: ControlMessage| {
        let command = message.command.clone();
        if let Err(err) = events.try_send(LifecycleEvent::Control(message)) {
            tracing::warn!(command = %command, error = %err, "Dropping supervisor command");
        }
    })?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            result = channel.run() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "Control channel failed");
                }
            }
            _ = stopped.recv() => tracing::debug!("Control reader stopped"),
        }
    }))
}

impl<D> std::fmt::Debug for Service<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("coordinator", &self.coordinator)
            .field("resolver", &self.resolver)
            .field("supervised", &self.control.is_some())
            .finish_non_exhaustive()
    }
}
