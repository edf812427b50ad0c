//! Worker process lifecycle manager.
//!
//! Spawns the single worker, pumps its stdout/stderr through the line framer
//! and classifier into the bridge's event channel, and reports its exit as a
//! `system` event. Restarting is always an explicit decision of the caller.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relaybridge_core::config::{BusyPolicy, WorkerConfig};
use relaybridge_core::{Event, OutputStream, classify};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reader::LineReader;

/// How long to wait for output pipes to drain after the worker exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from worker supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Worker executable not found: {path}")]
    ExecutableNotFound { path: PathBuf },

    #[error("No worker executable configured")]
    NotConfigured,

    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker is not running")]
    NotRunning,

    #[error("Worker stdin is not available")]
    InputClosed,
}

/// Handle to the running worker, owned by the supervisor's slot.
struct ActiveWorker {
    pid: Option<u32>,
    stop: CancellationToken,
    done: watch::Receiver<bool>,
    stdin_tx: Option<mpsc::Sender<String>>,
}

/// Supervises at most one worker process.
pub struct WorkerSupervisor {
    config: WorkerConfig,
    events: mpsc::Sender<Event>,
    slot: Arc<Mutex<Option<ActiveWorker>>>,
    running: Arc<AtomicBool>,
}

impl WorkerSupervisor {
    /// Create a supervisor that pushes every classified event into `events`.
    pub fn new(config: WorkerConfig, events: mpsc::Sender<Event>) -> Self {
        Self {
            config,
            events,
            slot: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a worker is currently running. Lock-free, safe to poll.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// OS process id of the running worker.
    pub async fn pid(&self) -> Option<u32> {
        self.slot.lock().await.as_ref().and_then(|w| w.pid)
    }

    /// Spawn the worker. Returns as soon as the process is started.
    ///
    /// A missing executable is reported once as an `error` event and not
    /// retried.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let path = self
            .config
            .path
            .clone()
            .ok_or(SupervisorError::NotConfigured)?;

        if self.config.on_busy == BusyPolicy::Replace && self.is_running() {
            info!("Replacing running worker");
            self.terminate().await;
        }

        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        if !path.exists() {
            drop(slot);
            error!(path = %path.display(), "Worker executable not found");
            let err = SupervisorError::ExecutableNotFound { path };
            self.emit(Event::error(err.to_string())).await;
            return Err(err);
        }

        let mut cmd = Command::new(&path);
        cmd.args(&self.config.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.config.accept_commands {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        info!(
            path = %path.display(),
            args = ?self.config.args,
            "Spawning worker process"
        );
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed {
                reason: "Failed to capture stderr".to_string(),
            })?;
        let stdin_tx = child.stdin.take().map(spawn_stdin_writer);

        let pid = child.id();
        let stop = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        *slot = Some(ActiveWorker {
            pid,
            stop: stop.clone(),
            done: done_rx,
            stdin_tx,
        });
        self.running.store(true, Ordering::Release);

        tokio::spawn(supervise(Supervision {
            child,
            stdout,
            stderr,
            stop,
            done_tx,
            events: self.events.clone(),
            slot: Arc::clone(&self.slot),
            running: Arc::clone(&self.running),
            terminate_timeout: self.config.terminate_timeout(),
        }));

        info!(pid = ?pid, "Worker started");
        Ok(())
    }

    /// Stop the worker and wait until its process handle is released.
    ///
    /// Idempotent: returns immediately when no worker is running.
    pub async fn terminate(&self) {
        let active = self
            .slot
            .lock()
            .await
            .as_ref()
            .map(|w| (w.stop.clone(), w.done.clone()));
        let Some((stop, mut done)) = active else {
            debug!("Terminate requested but no worker is running");
            return;
        };

        info!("Terminating worker");
        stop.cancel();
        if done.wait_for(|finished| *finished).await.is_err() {
            warn!("Worker supervision ended without reporting completion");
        }
    }

    /// Write one line to the worker's stdin.
    pub async fn send_input(&self, line: String) -> Result<(), SupervisorError> {
        let tx = {
            let slot = self.slot.lock().await;
            let worker = slot.as_ref().ok_or(SupervisorError::NotRunning)?;
            worker
                .stdin_tx
                .clone()
                .ok_or(SupervisorError::InputClosed)?
        };
        tx.send(line)
            .await
            .map_err(|_| SupervisorError::InputClosed)
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            warn!("Event channel closed, worker event dropped");
        }
    }
}

fn spawn_stdin_writer(mut stdin: tokio::process::ChildStdin) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!("Failed to write to worker stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!("Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush worker stdin: {}", e);
                break;
            }
        }
    });
    tx
}

struct Supervision<O, E> {
    child: Child,
    stdout: O,
    stderr: E,
    stop: CancellationToken,
    done_tx: watch::Sender<bool>,
    events: mpsc::Sender<Event>,
    slot: Arc<Mutex<Option<ActiveWorker>>>,
    running: Arc<AtomicBool>,
    terminate_timeout: Duration,
}

/// Owns the child process until it exits, then reports the exit.
async fn supervise<O, E>(ctx: Supervision<O, E>)
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let Supervision {
        mut child,
        stdout,
        stderr,
        stop,
        done_tx,
        events,
        slot,
        running,
        terminate_timeout,
    } = ctx;

    let mut stdout_task = tokio::spawn(pump(stdout, OutputStream::Stdout, events.clone()));
    let mut stderr_task = tokio::spawn(pump(stderr, OutputStream::Stderr, events.clone()));

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = stop.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => stop_child(&mut child, terminate_timeout).await,
    };
    drop(child);

    // Let buffered output reach the event channel before the exit event.
    let drain = async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        // A descendant still holds the pipes; nothing it writes now belongs
        // to this worker.
        warn!("Worker output did not close after exit, dropping readers");
        stdout_task.abort();
        stderr_task.abort();
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    }

    let code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "Failed to collect worker exit status");
            None
        }
    };

    *slot.lock().await = None;
    running.store(false, Ordering::Release);
    info!(exit_code = ?code, "Worker process exited");

    if events.send(Event::worker_exited(code)).await.is_err() {
        warn!("Event channel closed, exit event dropped");
    }
    let _ = done_tx.send(true);
}

/// SIGTERM, then SIGKILL once `timeout` elapses.
async fn stop_child(child: &mut Child, timeout: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process ID obtained from our own Child handle,
            // which has not been reaped yet.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Timeout waiting for worker to exit, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Frame and classify one output stream into the event channel.
async fn pump<R: AsyncRead + Unpin>(reader: R, stream: OutputStream, events: mpsc::Sender<Event>) {
    let mut lines = LineReader::new(reader);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if events.send(classify(&line, stream)).await.is_err() {
                    warn!(stream = stream.as_str(), "Event channel closed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream = stream.as_str(), error = %e, "Failed to read worker output");
                break;
            }
        }
    }
    debug!(stream = stream.as_str(), "Worker output reader finished");
}
