//! Lifecycle control for one managed inference server: a state machine
//! wiring a [`ProcessHandle`], a [`LogSink`] and a [`HealthProbe`]
//! together, with typed events fanned out to subscribers.

pub mod diffusion;
pub mod llama;

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{AgentError, AgentResult, ServerFault};
use crate::health::{HealthProbe, HealthStatus, DEFAULT_REQUEST_TIMEOUT};
use crate::logsink::{LogLevel, LogSink};
use crate::models::ModelCatalog;
use crate::process::{ExitInfo, OutputLine, ProcessHandle};

/// Lines of log context captured into a crash report.
const CRASH_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// What to launch a server with. Copied into the supervisor on a
/// successful start so restart and restore can reuse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub model_id: String,
    pub port: u16,
    pub threads: Option<u32>,
    pub context_size: Option<u32>,
    pub gpu_layers: Option<u32>,
    pub parallel_requests: Option<u32>,
    pub flash_attention: Option<bool>,
}

impl ServerConfig {
    pub fn new(model_id: impl Into<String>, port: u16) -> Self {
        ServerConfig {
            model_id: model_id.into(),
            port,
            threads: None,
            context_size: None,
            gpu_layers: None,
            parallel_requests: None,
            flash_attention: None,
        }
    }

    pub fn validate(&self) -> AgentResult<()> {
        if self.model_id.is_empty() {
            return Err(ServerFault::Other("configuration has an empty model id".into()).into());
        }
        if self.port == 0 {
            return Err(ServerFault::Other("configuration has port 0".into()).into());
        }
        Ok(())
    }
}

/// Read-side projection of a supervisor, recomputed on request.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub status: ServerStatus,
    pub health: HealthStatus,
    pub pid: Option<u32>,
    pub port: u16,
    pub model_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Loading,
    Diffusion,
    Decoding,
}

/// Lifecycle events, emitted in transition order. Receivers that lag are
/// dropped rather than blocking the supervisor.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started,
    Stopped,
    Crashed {
        message: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        tail: Vec<String>,
    },
    Restarted(ServerInfo),
    BinaryLog {
        message: String,
        level: LogLevel,
    },
    StatusChanged {
        new: ServerStatus,
        old: ServerStatus,
    },
    Progress {
        current_step: u32,
        total_steps: u32,
        stage: ProgressStage,
        percentage: f32,
    },
}

/// What a concrete server contributes: its binary, default port, and how
/// a [`ServerConfig`] becomes an argv.
pub trait ServerSpec: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn binary(&self) -> &Path;
    fn default_port(&self) -> u16;
    fn build_args(&self, config: &ServerConfig, model_path: &Path) -> Vec<String>;
}

#[derive(Debug)]
struct SupervisorState {
    status: ServerStatus,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    config: Option<ServerConfig>,
    handle: Option<Arc<ProcessHandle>>,
    error: Option<String>,
    /// Bumped on every start so stale exit observers can tell they are
    /// watching a previous child.
    epoch: u64,
}

/// Lifecycle manager for one child server. `start`/`stop`/`restart` are
/// serialized by an internal lock; accessors never block on it.
pub struct Supervisor {
    spec: Arc<dyn ServerSpec>,
    catalog: Arc<ModelCatalog>,
    sink: Arc<LogSink>,
    probe: HealthProbe,
    start_timeout: Duration,
    stop_timeout: Duration,
    state: Arc<StdMutex<SupervisorState>>,
    lifecycle: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ServerEvent>,
}

impl Supervisor {
    pub fn new(
        spec: Arc<dyn ServerSpec>,
        catalog: Arc<ModelCatalog>,
        sink: LogSink,
        start_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Supervisor {
            spec,
            catalog,
            sink: Arc::new(sink),
            probe: HealthProbe::new(),
            start_timeout,
            stop_timeout,
            state: Arc::new(StdMutex::new(SupervisorState {
                status: ServerStatus::Stopped,
                pid: None,
                started_at: None,
                config: None,
                handle: None,
                error: None,
                epoch: 0,
            })),
            lifecycle: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec.name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> ServerStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == ServerStatus::Running
    }

    pub fn has_crashed(&self) -> bool {
        self.status() == ServerStatus::Crashed
    }

    /// Last config handed to a successful `start`, if any.
    pub fn config(&self) -> Option<ServerConfig> {
        self.state.lock().unwrap().config.clone()
    }

    /// Snapshot projection, with a fresh health probe when the server is up.
    pub async fn info(&self) -> ServerInfo {
        let (status, pid, started_at, config, error) = {
            let state = self.state.lock().unwrap();
            (
                state.status,
                state.pid,
                state.started_at,
                state.config.clone(),
                state.error.clone(),
            )
        };
        let port = config
            .as_ref()
            .map(|c| c.port)
            .unwrap_or_else(|| self.spec.default_port());
        let health = match status {
            ServerStatus::Running | ServerStatus::Starting => {
                self.probe.probe(port, DEFAULT_REQUEST_TIMEOUT).await
            }
            _ => HealthStatus::Unknown,
        };
        ServerInfo {
            status,
            health,
            pid,
            port,
            model_id: config.map(|c| c.model_id).unwrap_or_default(),
            started_at,
            error,
        }
    }

    /// One fresh health probe against the server's port.
    pub async fn health(&self) -> HealthStatus {
        self.info().await.health
    }

    /// Last `lines` lines of the server's log. Never fails; an
    /// uninitialized sink reads as empty.
    pub fn get_logs(&self, lines: usize) -> Vec<String> {
        self.sink.tail(lines)
    }

    /// Truncate the server's log. Silent on failure.
    pub fn clear_logs(&self) {
        if let Err(e) = self.sink.clear() {
            tracing::debug!("failed to clear {} log: {}", self.spec.name(), e);
        }
    }

    pub fn log_sink(&self) -> &LogSink {
        &self.sink
    }

    pub async fn start(&self, config: ServerConfig) -> AgentResult<ServerInfo> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(config).await
    }

    pub async fn stop(&self) -> AgentResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    /// Stop and start again with the previous config.
    pub async fn restart(&self) -> AgentResult<ServerInfo> {
        let _guard = self.lifecycle.lock().await;
        let config = self
            .config()
            .ok_or(AgentError::Server(ServerFault::NoConfig))?;
        self.stop_locked().await?;
        let info = self.start_locked(config).await?;
        self.emit(ServerEvent::Restarted(info.clone()));
        Ok(info)
    }

    async fn start_locked(&self, config: ServerConfig) -> AgentResult<ServerInfo> {
        config.validate()?;

        let current = self.status();
        if !matches!(current, ServerStatus::Stopped | ServerStatus::Crashed) {
            return Err(ServerFault::AlreadyRunning.into());
        }

        // Reserve the port before touching any state: if something else
        // already answers there, starting would poll a stranger's health.
        if self
            .probe
            .is_responding(config.port, DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            return Err(AgentError::PortInUse { port: config.port });
        }

        let binary = self.spec.binary().to_path_buf();
        if !binary.is_file() {
            return Err(AgentError::Binary {
                path: binary.display().to_string(),
                reason: "not found or not a regular file".to_string(),
            });
        }

        let artifact = self.catalog.resolve(&config.model_id)?;

        if let Err(e) = self.sink.initialize() {
            tracing::warn!("could not initialize {} log sink: {}", self.spec.name(), e);
        }

        let args = self.spec.build_args(&config, &artifact.path);
        tracing::info!(
            "starting {}: {} {}",
            self.spec.name(),
            binary.display(),
            args.join(" ")
        );

        let mut handle = ProcessHandle::spawn(&binary, &args, None, &[])?;
        let pid = handle.pid();
        let output = handle.take_output().expect("fresh handle owns its output");
        let mut exit_rx = handle.exit_watch();
        let handle = Arc::new(handle);

        let epoch = {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;
            state.pid = Some(pid);
            state.started_at = None;
            state.config = Some(config.clone());
            state.handle = Some(Arc::clone(&handle));
            state.error = None;
            state.epoch
        };
        self.transition(ServerStatus::Starting);

        self.spawn_log_pump(output);
        self.spawn_exit_observer(exit_rx.clone(), epoch);

        tokio::select! {
            ready = self.probe.wait_ready(config.port, self.start_timeout) => match ready {
                Ok(()) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        state.started_at = Some(Utc::now());
                    }
                    self.transition(ServerStatus::Running);
                    self.emit(ServerEvent::Started);
                    tracing::info!("{} is serving on port {} (pid {})", self.spec.name(), config.port, pid);
                    Ok(self.info().await)
                }
                Err(_) => {
                    tracing::error!(
                        "{} did not become ready within {:?}, killing pid {}",
                        self.spec.name(),
                        self.start_timeout,
                        pid
                    );
                    if let Err(e) = handle.kill(self.stop_timeout).await {
                        tracing::warn!("failed to kill unready {}: {}", self.spec.name(), e);
                    }
                    let fault = ServerFault::StartupTimeout {
                        timeout_secs: self.start_timeout.as_secs(),
                    };
                    self.mark_crashed(fault.to_string(), None, None);
                    Err(fault.into())
                }
            },
            exited = async { exit_rx.wait_for(Option::is_some).await.map(|v| *v) } => {
                let info = exited.ok().and_then(|v| v).unwrap_or(ExitInfo { code: None, signal: None });
                let tail = self.sink.tail(CRASH_TAIL_LINES);
                let fault = ServerFault::UnexpectedExit {
                    code: info.code,
                    signal: info.signal,
                    tail: tail.clone(),
                };
                let message = format!("{} exited during startup: {}", self.spec.name(), fault);
                self.mark_crashed(message.clone(), info.code, info.signal);
                self.emit(ServerEvent::Crashed {
                    message,
                    exit_code: info.code,
                    signal: info.signal,
                    tail,
                });
                Err(fault.into())
            }
        }
    }

    async fn stop_locked(&self) -> AgentResult<()> {
        let (status, handle) = {
            let state = self.state.lock().unwrap();
            (state.status, state.handle.clone())
        };

        // Idempotent: nothing alive to stop. A crashed child is already
        // gone; only start() leaves the crashed state.
        if matches!(status, ServerStatus::Stopped | ServerStatus::Crashed) {
            return Ok(());
        }

        self.transition(ServerStatus::Stopping);
        if let Some(handle) = handle {
            handle.kill(self.stop_timeout).await?;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.pid = None;
            state.started_at = None;
            state.handle = None;
        }
        self.transition(ServerStatus::Stopped);
        self.emit(ServerEvent::Stopped);
        tracing::info!("{} stopped", self.spec.name());
        Ok(())
    }

    fn transition(&self, new: ServerStatus) {
        let old = {
            let mut state = self.state.lock().unwrap();
            let old = state.status;
            state.status = new;
            old
        };
        if old != new {
            tracing::debug!("{}: {} -> {}", self.spec.name(), old, new);
            self.emit(ServerEvent::StatusChanged { new, old });
        }
    }

    fn mark_crashed(&self, message: String, code: Option<i32>, signal: Option<i32>) {
        {
            let mut state = self.state.lock().unwrap();
            state.pid = None;
            state.started_at = None;
            state.handle = None;
            state.error = Some(match (code, signal) {
                (None, None) => message.clone(),
                _ => format!("{message} (code {code:?}, signal {signal:?})"),
            });
        }
        self.transition(ServerStatus::Crashed);
    }

    /// Feed child output into the log sink and fan each line out as a
    /// `BinaryLog` event, in read order.
    fn spawn_log_pump(&self, mut output: tokio::sync::mpsc::UnboundedReceiver<OutputLine>) {
        let sink = Arc::clone(&self.sink);
        let events = self.events.clone();
        let name = self.spec.name();
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                let (message, level) = match line {
                    OutputLine::Stdout(l) => {
                        let level = LogLevel::infer(&l, false);
                        (l, level)
                    }
                    OutputLine::Stderr(l) => {
                        let level = LogLevel::infer(&l, true);
                        (l, level)
                    }
                };
                if let Err(e) = sink.append(&message, level) {
                    tracing::debug!("{} log append failed: {}", name, e);
                }
                let _ = events.send(ServerEvent::BinaryLog { message, level });
            }
        });
    }

    /// Watch for the child dying underneath a running server. Stop and
    /// startup-phase exits are handled by their own code paths; this task
    /// only fires on the running -> crashed edge.
    fn spawn_exit_observer(
        &self,
        mut exit_rx: tokio::sync::watch::Receiver<Option<ExitInfo>>,
        epoch: u64,
    ) {
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let events = self.events.clone();
        let name = self.spec.name();
        tokio::spawn(async move {
            let info = match exit_rx.wait_for(Option::is_some).await {
                Ok(value) => (*value).unwrap_or(ExitInfo { code: None, signal: None }),
                Err(_) => return,
            };

            let crashed = {
                let mut locked = state.lock().unwrap();
                if locked.epoch != epoch || locked.status != ServerStatus::Running {
                    false
                } else {
                    locked.status = ServerStatus::Crashed;
                    locked.pid = None;
                    locked.started_at = None;
                    locked.handle = None;
                    locked.error = Some(format!(
                        "process exited unexpectedly (code {:?}, signal {:?})",
                        info.code, info.signal
                    ));
                    true
                }
            };
            if !crashed {
                return;
            }

            tracing::error!(
                "{} exited unexpectedly (code {:?}, signal {:?})",
                name,
                info.code,
                info.signal
            );
            let _ = sink.append(
                &format!(
                    "process exited unexpectedly (code {:?}, signal {:?})",
                    info.code, info.signal
                ),
                LogLevel::Error,
            );
            let tail = sink.tail(CRASH_TAIL_LINES);
            let _ = events.send(ServerEvent::StatusChanged {
                new: ServerStatus::Crashed,
                old: ServerStatus::Running,
            });
            let _ = events.send(ServerEvent::Crashed {
                message: format!("{name} exited unexpectedly"),
                exit_code: info.code,
                signal: info.signal,
                tail,
            });
        });
    }
}
