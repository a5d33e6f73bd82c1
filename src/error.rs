use serde::Serialize;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

/// Failures surfaced by the agent, each with a stable machine-readable code.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model '{model_id}' is not in the local catalog")]
    ModelNotFound { model_id: String },

    #[error("port {port} is already answering requests")]
    PortInUse { port: u16 },

    #[error("server binary unusable at {path}: {reason}")]
    Binary { path: String, reason: String },

    #[error("insufficient resources: {reason}")]
    InsufficientResources { reason: String },

    #[error("file system operation failed on {path}")]
    FileSystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error(transparent)]
    Server(#[from] ServerFault),
}

/// Supervisor and orchestrator failures grouped under the `SERVER_ERROR` code.
#[derive(Debug, Error)]
pub enum ServerFault {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("no previous configuration to restart with")]
    NoConfig,

    #[error("failed to spawn server process")]
    Spawn(#[source] std::io::Error),

    #[error("server did not become ready within {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    #[error("health endpoint on port {port} never reported ok ({attempts} attempts)")]
    HealthTimeout { port: u16, attempts: u32 },

    #[error("server process exited unexpectedly (code {code:?}, signal {signal:?})")]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
        tail: Vec<String>,
    },

    #[error("text server is running without a configuration to save")]
    CannotOffload,

    #[error("another image generation is already in flight")]
    Busy,

    #[error("a saved text-server state is pending restore")]
    RestorePending,

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            AgentError::PortInUse { .. } => "PORT_IN_USE",
            AgentError::Binary { .. } => "BINARY_ERROR",
            AgentError::InsufficientResources { .. } => "INSUFFICIENT_RESOURCES",
            AgentError::FileSystem { .. } => "FILE_SYSTEM_ERROR",
            AgentError::Checksum { .. } => "CHECKSUM_ERROR",
            AgentError::Download { .. } => "DOWNLOAD_FAILED",
            AgentError::Server(_) => "SERVER_ERROR",
        }
    }

    pub fn suggestion(&self) -> Option<String> {
        match self {
            AgentError::ModelNotFound { model_id } => Some(format!(
                "Place '{model_id}' in the model directory or pass a full path"
            )),
            AgentError::PortInUse { port } => Some(format!(
                "Stop the process listening on port {port} or configure a different port"
            )),
            AgentError::Binary { .. } => {
                Some("Reinstall the server binary or point DUET_*_SERVER_PATH at a valid build".into())
            }
            AgentError::Server(ServerFault::Busy) => {
                Some("Wait for the current generation to finish and retry".into())
            }
            AgentError::Server(ServerFault::RestorePending) => {
                Some("Retry the text-server restore or clear the saved state first".into())
            }
            AgentError::Server(ServerFault::StartupTimeout { .. })
            | AgentError::Server(ServerFault::HealthTimeout { .. }) => {
                Some("Check the server log for load errors; large models can need a longer startup timeout".into())
            }
            _ => None,
        }
    }
}

/// Shape handed across the process boundary for display.
#[derive(Debug, Clone, Serialize)]
pub struct UiError {
    pub code: String,
    pub title: String,
    pub message: String,
    pub remediation: Option<String>,
}

impl From<&AgentError> for UiError {
    fn from(err: &AgentError) -> Self {
        let title = match err {
            AgentError::ModelNotFound { .. } => "Model not found",
            AgentError::PortInUse { .. } => "Port in use",
            AgentError::Binary { .. } => "Server binary problem",
            AgentError::InsufficientResources { .. } => "Not enough resources",
            AgentError::FileSystem { .. } => "File system error",
            AgentError::Checksum { .. } => "Corrupt download",
            AgentError::Download { .. } => "Download failed",
            AgentError::Server(_) => "Server error",
        };
        UiError {
            code: err.code().to_string(),
            title: title.to_string(),
            message: err.to_string(),
            remediation: err.suggestion(),
        }
    }
}
