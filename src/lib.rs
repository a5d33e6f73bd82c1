//! Local supervisor for two cooperating inference servers — llama.cpp for
//! text and stable-diffusion.cpp for images — sharing one workstation's
//! RAM and VRAM. The orchestrator evicts the text server when both will
//! not fit and restores it once the image request is done.

pub mod config;
pub mod error;
pub mod health;
pub mod logsink;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod system;

pub use config::Config;
pub use error::{AgentError, AgentResult, ServerFault, UiError};
pub use health::{HealthProbe, HealthStatus};
pub use logsink::{LogEntry, LogLevel, LogSink};
pub use models::{format_size, ModelArtifact, ModelCatalog};
pub use orchestrator::{ResourceOrchestrator, SavedLlmState};
pub use registry::{GenerationRegistry, GenerationStatus, GenerationUpdate};
pub use supervisor::diffusion::{DiffusionSupervisor, ImageGenerationConfig, ImageGenerationResult};
pub use supervisor::llama::LlamaSupervisor;
pub use supervisor::{ServerConfig, ServerEvent, ServerInfo, ServerStatus, Supervisor};
pub use system::{HostProbe, SystemInfoSource, SystemSnapshot};
