//! Gateway-side end of one model's channel.
//!
//! Owns the pipes to a single worker, serializes request/response exchanges
//! on that channel, bounds every wait, and restarts the worker under
//! supervision when it stops answering or goes away.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::Instant;

use super::ipc_types::*;
use super::process_manager::{ProcessManager, WorkerCommandLine};

/// How long a worker gets to acknowledge `Shutdown`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Shared reference to a WorkerBridge.
pub type SharedWorkerBridge = Arc<WorkerBridge>;

/// Whether a model can currently take requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Serving,
    /// Worker stopped answering; a supervised restart is pending or running.
    Degraded,
    /// Restarts exhausted or shut down.
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_restarts: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(120),
            max_restarts: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("worker for '{0}' is unavailable")]
    Unavailable(String),
    #[error("worker for '{model}' did not answer within {timeout:?}")]
    Timeout { model: String, timeout: Duration },
    #[error("channel to worker for '{0}' closed")]
    Closed(String),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker pipes are not available")]
    Pipes,
    #[error("startup failed at {stage} stage: {message}")]
    Failed { stage: StartupStage, message: String },
    #[error("worker exited before reporting readiness")]
    Exited,
    #[error("worker did not become ready within {0:?}")]
    Timeout(Duration),
    #[error("unexpected handshake from worker: {0}")]
    Handshake(String),
}

/// The two directions of one channel.
struct ChannelIo {
    /// Sends JSON lines to the writer thread.
    cmd_tx: Sender<String>,
    /// Lines read from the worker.
    line_rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelIo {
    fn connect<R, W>(model: &str, reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<String>();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

        let name = model.to_string();
        thread::spawn(move || stdin_writer(&name, cmd_rx, writer));
        let name = model.to_string();
        thread::spawn(move || stdout_reader(&name, reader, line_tx));

        Self { cmd_tx, line_rx }
    }

    /// Wait for the worker's `Ready` (or `StartupFailed`) announcement.
    async fn handshake(&mut self, model: &str, timeout: Duration) -> Result<Vec<String>, StartupError> {
        let line = match tokio::time::timeout(timeout, self.line_rx.recv()).await {
            Err(_) => return Err(StartupError::Timeout(timeout)),
            Ok(None) => return Err(StartupError::Exited),
            Ok(Some(line)) => line,
        };
        let response: WorkerResponse =
            serde_json::from_str(&line).map_err(|e| StartupError::Handshake(e.to_string()))?;
        match response.payload {
            WorkerPayload::Ready {
                model: ready_model,
                methods,
            } if ready_model == model => Ok(methods),
            WorkerPayload::StartupFailed { stage, message } => Err(StartupError::Failed { stage, message }),
            other => Err(StartupError::Handshake(format!("{other:?}"))),
        }
    }
}

/// Gateway-side handle to one model's worker.
#[derive(Debug)]
pub struct WorkerBridge {
    model: String,
    /// Held for the whole send/receive exchange: one request in flight per
    /// channel. `None` while the worker is gone.
    channel: TokioMutex<Option<ChannelIo>>,
    health: Mutex<WorkerHealth>,
    methods: Mutex<Vec<String>>,
    next_id: AtomicU64,
    restarts: AtomicU32,
    settings: BridgeSettings,
    /// Absent for channels not backed by a child process.
    process: Option<Arc<ProcessManager>>,
}

impl std::fmt::Debug for ChannelIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelIo")
    }
}

impl WorkerBridge {
    /// Spawn the worker process for `model` and wait until it is serving.
    pub async fn spawn(
        model: &str,
        command: WorkerCommandLine,
        settings: BridgeSettings,
    ) -> Result<SharedWorkerBridge, StartupError> {
        let process = Arc::new(ProcessManager::spawn(model, command).map_err(StartupError::Spawn)?);
        let mut io = connect_process(model, &process)?;
        let methods = io.handshake(model, settings.startup_timeout).await?;
        Ok(Arc::new(Self::new(model, io, methods, settings, Some(process))))
    }

    /// Attach to a worker reachable through an existing reader/writer pair.
    /// Such a bridge cannot restart its worker.
    pub async fn attach<R, W>(
        model: &str,
        reader: R,
        writer: W,
        settings: BridgeSettings,
    ) -> Result<SharedWorkerBridge, StartupError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut io = ChannelIo::connect(model, reader, writer);
        let methods = io.handshake(model, settings.startup_timeout).await?;
        Ok(Arc::new(Self::new(model, io, methods, settings, None)))
    }

    fn new(
        model: &str,
        io: ChannelIo,
        methods: Vec<String>,
        settings: BridgeSettings,
        process: Option<Arc<ProcessManager>>,
    ) -> Self {
        info!("[BRIDGE] Worker for '{model}' is serving [{}]", methods.join(", "));
        Self {
            model: model.to_string(),
            channel: TokioMutex::new(Some(io)),
            health: Mutex::new(WorkerHealth::Serving),
            methods: Mutex::new(methods),
            next_id: AtomicU64::new(1),
            restarts: AtomicU32::new(0),
            settings,
            process,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn health(&self) -> WorkerHealth {
        self.health
            .lock()
            .map(|h| *h)
            .unwrap_or(WorkerHealth::Terminated)
    }

    fn set_health(&self, next: WorkerHealth) {
        if let Ok(mut health) = self.health.lock() {
            *health = next;
        }
    }

    /// Methods the worker reported as callable.
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Worker restarts that completed so far.
    pub fn restart_count(&self) -> u32 {
        self.process.as_ref().map_or(0, |p| p.restart_count())
    }

    /// Send one call and wait (bounded) for its reply. The bound covers
    /// queueing behind other calls on this channel as well as the exchange.
    /// A timeout or closed channel during the exchange marks the model
    /// degraded and schedules a supervised restart.
    pub async fn invoke(
        self: &Arc<Self>,
        method: &str,
        payload: Value,
    ) -> Result<WorkerPayload, BridgeError> {
        if self.health() != WorkerHealth::Serving {
            return Err(BridgeError::Unavailable(self.model.clone()));
        }

        let deadline = Instant::now() + self.settings.request_timeout;
        let Ok(mut guard) = tokio::time::timeout_at(deadline, self.channel.lock()).await else {
            // Still busy with earlier calls; the worker itself is fine.
            warn!("[BRIDGE] Timed out waiting for the channel to '{}'", self.model);
            return Err(self.timeout_error());
        };
        let Some(io) = guard.as_mut() else {
            return Err(BridgeError::Unavailable(self.model.clone()));
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WorkerRequest {
            id,
            command: WorkerCommand::Invoke {
                model: self.model.clone(),
                method: method.to_string(),
                payload,
            },
        };
        let json = serde_json::to_string(&request)?;

        match self.exchange(io, id, json, deadline).await {
            Ok(payload) => Ok(payload),
            Err(e) => {
                warn!("[BRIDGE] {e}; marking '{}' degraded", self.model);
                *guard = None;
                self.set_health(WorkerHealth::Degraded);
                drop(guard);

                let bridge = Arc::clone(self);
                tokio::spawn(async move { bridge.supervise().await });
                Err(e)
            }
        }
    }

    fn timeout_error(&self) -> BridgeError {
        BridgeError::Timeout {
            model: self.model.clone(),
            timeout: self.settings.request_timeout,
        }
    }

    /// Write one request line and wait until `deadline` for the response
    /// carrying `id`.
    async fn exchange(
        &self,
        io: &mut ChannelIo,
        id: u64,
        json: String,
        deadline: Instant,
    ) -> Result<WorkerPayload, BridgeError> {
        io.cmd_tx
            .send(json)
            .map_err(|_| BridgeError::Closed(self.model.clone()))?;

        loop {
            let line = match tokio::time::timeout_at(deadline, io.line_rx.recv()).await {
                Err(_) => return Err(self.timeout_error()),
                Ok(None) => return Err(BridgeError::Closed(self.model.clone())),
                Ok(Some(line)) => line,
            };
            let response: WorkerResponse = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("[BRIDGE] Failed to parse response from '{}': {e}", self.model);
                    continue;
                }
            };
            if response.id == id {
                return Ok(response.payload);
            }
            // Late reply to a request that already timed out, or a bad-frame notice.
            warn!(
                "[BRIDGE] Discarding response id={} from '{}' (waiting for {id})",
                response.id, self.model
            );
        }
    }

    /// Restart the worker until it is serving again or the restart budget
    /// is spent.
    async fn supervise(&self) {
        let Some(process) = self.process.clone() else {
            error!("[BRIDGE] Worker for '{}' cannot be restarted", self.model);
            self.set_health(WorkerHealth::Terminated);
            return;
        };

        let mut guard = self.channel.lock().await;
        if self.health() != WorkerHealth::Degraded {
            return;
        }
        if process.is_alive() {
            warn!("[BRIDGE] Worker for '{}' is still running but unresponsive", self.model);
        }
        loop {
            let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.settings.max_restarts {
                break;
            }
            info!(
                "[BRIDGE] Restarting worker for '{}' ({attempt}/{})",
                self.model, self.settings.max_restarts
            );
            match self.respawn(&process).await {
                Ok((io, methods)) => {
                    *guard = Some(io);
                    if let Ok(mut m) = self.methods.lock() {
                        *m = methods;
                    }
                    self.set_health(WorkerHealth::Serving);
                    info!("[BRIDGE] Worker for '{}' is serving again", self.model);
                    return;
                }
                Err(e) => error!("[BRIDGE] Restart of '{}' failed: {e}", self.model),
            }
        }

        error!(
            "[BRIDGE] Giving up on '{}' after {} restart(s)",
            self.model, self.settings.max_restarts
        );
        self.set_health(WorkerHealth::Terminated);
        let _ = tokio::task::spawn_blocking(move || process.kill()).await;
    }

    async fn respawn(&self, process: &Arc<ProcessManager>) -> Result<(ChannelIo, Vec<String>), StartupError> {
        let pm = Arc::clone(process);
        tokio::task::spawn_blocking(move || pm.restart())
            .await
            .map_err(|e| StartupError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .map_err(StartupError::Spawn)?;
        let mut io = connect_process(&self.model, process)?;
        let methods = io.handshake(&self.model, self.settings.startup_timeout).await?;
        Ok((io, methods))
    }

    /// Ask the worker to exit, then make sure it has.
    pub async fn shutdown(&self) {
        self.set_health(WorkerHealth::Terminated);
        let mut guard = self.channel.lock().await;
        if let Some(mut io) = guard.take() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = WorkerRequest {
                id,
                command: WorkerCommand::Shutdown,
            };
            if let Ok(json) = serde_json::to_string(&request) {
                let _ = self.exchange(&mut io, id, json, Instant::now() + SHUTDOWN_GRACE).await;
            }
        }
        if let Some(process) = self.process.clone() {
            let _ = tokio::task::spawn_blocking(move || process.kill()).await;
        }
        info!("[BRIDGE] Worker for '{}' shut down", self.model);
    }
}

fn connect_process(model: &str, process: &ProcessManager) -> Result<ChannelIo, StartupError> {
    let stdin = process.take_stdin().ok_or(StartupError::Pipes)?;
    let stdout = process.take_stdout().ok_or(StartupError::Pipes)?;
    Ok(ChannelIo::connect(model, stdout, stdin))
}

/// Thread that writes commands to the worker's stdin.
fn stdin_writer<W: Write>(model: &str, cmd_rx: Receiver<String>, mut writer: W) {
    for json_line in cmd_rx.iter() {
        if writeln!(writer, "{json_line}").is_err() || writer.flush().is_err() {
            warn!("[BRIDGE] Failed to write to worker for '{model}'");
            break;
        }
    }
}

/// Thread that reads response lines from the worker's stdout.
fn stdout_reader<R: Read>(model: &str, reader: R, line_tx: mpsc::UnboundedSender<String>) {
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(l) if !l.trim().is_empty() => {
                if line_tx.send(l).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("[BRIDGE] Read error from worker for '{model}': {e}");
                break;
            }
        }
    }
    info!("[BRIDGE] Channel from worker for '{model}' closed");
}
