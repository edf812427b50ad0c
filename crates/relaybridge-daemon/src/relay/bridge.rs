//! The coordinating context object.
//!
//! [`Bridge`] owns every piece of mutable bridge state: the worker
//! supervisor, the connection registry and the upstream link. Worker events
//! flow through a single dispatch task, so every observer and the upstream
//! link see them in framing order.

use std::sync::Arc;
use std::time::Duration;

use relaybridge_core::config::{Config, WorkerStart};
use relaybridge_core::event::{Inbound, Progress};
use relaybridge_core::{Event, EventKind};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;
use crate::subprocess::{SupervisorError, WorkerSupervisor};
use crate::upstream::{LinkState, UpstreamConfig, UpstreamLink};

/// Worker events waiting for the dispatcher.
const EVENT_BUFFER: usize = 256;

/// Upstream commands waiting to be written to the worker.
const COMMAND_BUFFER: usize = 32;

/// How long background tasks get to finish during shutdown.
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Snapshot returned by the status query surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub worker_running: bool,
    pub observer_count: usize,
    pub controller_connected: bool,
    /// `None` when no upstream is configured.
    pub upstream: Option<LinkState>,
}

pub struct Bridge {
    config: Config,
    registry: ConnectionRegistry,
    supervisor: Arc<WorkerSupervisor>,
    upstream: Option<Arc<UpstreamLink>>,
    shutdown_tx: watch::Sender<bool>,
    dispatch_stop: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Wire up all components and start the background tasks.
    ///
    /// The worker is started according to `worker.start`: right away, once
    /// the upstream link first connects, or never (manual).
    pub async fn start(config: Config) -> Arc<Self> {
        let registry = ConnectionRegistry::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let supervisor = Arc::new(WorkerSupervisor::new(config.worker.clone(), events_tx));
        let (shutdown_tx, _) = watch::channel(false);
        let dispatch_stop = CancellationToken::new();
        let mut tasks = Vec::new();

        let (command_tx, command_rx) = if config.worker.accept_commands {
            let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let upstream = config.upstream_url.as_ref().map(|url| {
            let link = UpstreamLink::new(UpstreamConfig::new(url, &config.upstream), registry.clone());
            Arc::new(match command_tx {
                Some(tx) => link.with_command_sink(tx),
                None => link,
            })
        });

        let dispatcher = tokio::spawn(dispatch(
            events_rx,
            registry.clone(),
            upstream.clone(),
            dispatch_stop.clone(),
        ));

        if let Some(link) = &upstream {
            info!(url = %link.url(), "Spawning upstream link");
            let link = Arc::clone(link);
            let shutdown = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move { link.run(shutdown).await }));
        }

        if let Some(commands) = command_rx {
            tasks.push(tokio::spawn(forward_commands(
                commands,
                Arc::clone(&supervisor),
                shutdown_tx.subscribe(),
            )));
        }

        match (config.effective_worker_start(), &upstream) {
            (WorkerStart::Immediate, _) => {
                if let Err(e) = supervisor.start().await {
                    warn!(error = %e, "Worker did not start");
                }
            }
            (WorkerStart::OnUpstream, Some(link)) => {
                tasks.push(tokio::spawn(start_on_upstream(
                    link.subscribe(),
                    Arc::clone(&supervisor),
                    shutdown_tx.subscribe(),
                )));
            }
            (WorkerStart::OnUpstream, None) | (WorkerStart::Manual, _) => {
                info!("Worker start deferred until requested");
            }
        }

        Arc::new(Self {
            config,
            registry,
            supervisor,
            upstream,
            shutdown_tx,
            dispatch_stop,
            dispatcher: Mutex::new(Some(dispatcher)),
            tasks: Mutex::new(tasks),
        })
    }

    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Outbound queue size for each new connection.
    pub const fn queue_capacity(&self) -> usize {
        self.config.observers.queue_capacity
    }

    /// Start the worker on request (manual mode or after it exited).
    pub async fn start_worker(&self) -> Result<(), SupervisorError> {
        self.supervisor.start().await
    }

    /// Stop the worker on request. Returns once its process is released.
    pub async fn stop_worker(&self) {
        self.supervisor.terminate().await;
    }

    /// Current state, without side effects.
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            worker_running: self.supervisor.is_running(),
            observer_count: self.registry.observer_count(),
            controller_connected: self.registry.has_controller(),
            upstream: self.upstream.as_ref().map(|link| link.state()),
        }
    }

    /// Events queued for a connection as soon as it is accepted.
    pub fn greeting(&self) -> Vec<Event> {
        let mut greeting = vec![Event::system("Connected to relay bridge")];
        if self.supervisor.is_running() {
            greeting.push(Event::system("Worker process is running"));
        } else if self.registry.has_controller() {
            greeting.push(Event::system("Controller is connected"));
        }
        greeting
    }

    /// Stop the upstream link, terminate the worker, then close every
    /// connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.shutdown_tx.send_replace(true);
        self.supervisor.terminate().await;

        // Let the worker's exit event reach observers before they are closed.
        self.dispatch_stop.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            join_with_grace(handle).await;
        }

        self.registry.close_all().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for handle in tasks {
            join_with_grace(handle).await;
        }
        info!("Bridge stopped");
    }
}

async fn join_with_grace(mut handle: JoinHandle<()>) {
    if tokio::time::timeout(TASK_SHUTDOWN_GRACE, &mut handle)
        .await
        .is_err()
    {
        warn!("Background task did not stop in time, aborting");
        handle.abort();
    }
}

/// Deliver each worker event to observers, then upstream.
async fn dispatch(
    mut events: mpsc::Receiver<Event>,
    registry: ConnectionRegistry,
    upstream: Option<Arc<UpstreamLink>>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            () = stop.cancelled() => break,
        };

        log_event(&event);
        let delivered = registry.broadcast(&event).await;
        let forwarded = match &upstream {
            Some(link) => link.send(&event).await,
            None => false,
        };
        debug!(kind = %event.kind(), delivered, forwarded, "Event dispatched");
    }
    debug!("Event dispatcher stopped");
}

fn log_event(event: &Event) {
    match event {
        Event::Structured { fields } => match Progress::from_fields(fields) {
            Some(progress) => info!(progress = %progress, "Worker progress"),
            None => debug!(fields = ?fields, "Structured worker event"),
        },
        Event::Log { message } => info!(stream = "stdout", "{message}"),
        Event::Error { message } => warn!(stream = "stderr", "{message}"),
        Event::System { message, exit_code } => {
            info!(exit_code = ?exit_code, kind = %EventKind::System, "{message}");
        }
    }
}

/// Start the worker once, on the first successful upstream connection.
async fn start_on_upstream(
    mut state: watch::Receiver<LinkState>,
    supervisor: Arc<WorkerSupervisor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connected = tokio::select! {
        result = state.wait_for(|s| *s == LinkState::Connected) => result.is_ok(),
        _ = shutdown.changed() => false,
    };
    if !connected {
        return;
    }

    info!("Upstream connected, starting worker");
    if let Err(e) = supervisor.start().await {
        warn!(error = %e, "Worker did not start");
    }
}

/// Write upstream commands to the worker's stdin.
async fn forward_commands(
    mut commands: mpsc::Receiver<Value>,
    supervisor: Arc<WorkerSupervisor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        let line = Inbound::command_line(&command);
        if let Err(e) = supervisor.send_input(line).await {
            warn!(error = %e, "Command not delivered to worker");
        }
    }
}
