use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};

pub const DEFAULT_LLAMA_PORT: u16 = 8080;
pub const DEFAULT_SD_PORT: u16 = 8081;
pub const DEFAULT_SERVER_START: Duration = Duration::from_secs(60);
pub const DEFAULT_SERVER_STOP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub model_dir: PathBuf,
    pub log_dir: PathBuf,
    pub llama_server_path: PathBuf,
    pub sd_server_path: PathBuf,
    pub llama_port: u16,
    pub sd_port: u16,
    pub gpu_layers: u32,
    pub sd_model: Option<String>,
    pub server_start_timeout: Duration,
    pub server_stop_timeout: Duration,
    /// Total VRAM of the GPU in bytes, when one is present.
    pub gpu_vram_bytes: Option<u64>,
    pub gpu_kind: Option<String>,
}

impl Config {
    pub fn load() -> AgentResult<Self> {
        let home = dirs::home_dir().ok_or_else(|| AgentError::FileSystem {
            path: "~".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "could not determine home directory"),
        })?;

        let model_dir = match std::env::var("DUET_MODEL_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => home.join(".duet").join("models"),
        };

        let log_dir = match std::env::var("DUET_LOG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => home.join(".duet").join("logs"),
        };

        let llama_server_path = std::env::var("DUET_LLAMA_SERVER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("llama-server"));

        let sd_server_path = std::env::var("DUET_SD_SERVER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("sd-server"));

        let llama_port: u16 = std::env::var("DUET_LLAMA_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LLAMA_PORT);

        let sd_port: u16 = std::env::var("DUET_SD_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SD_PORT);

        let gpu_layers: u32 = std::env::var("DUET_GPU_LAYERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let sd_model = std::env::var("DUET_SD_MODEL").ok().filter(|v| !v.is_empty());

        let server_start_timeout = std::env::var("DUET_SERVER_START_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SERVER_START);

        let server_stop_timeout = std::env::var("DUET_SERVER_STOP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SERVER_STOP);

        let gpu_vram_bytes: Option<u64> = std::env::var("DUET_GPU_VRAM_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0);

        let gpu_kind = std::env::var("DUET_GPU_KIND").ok().filter(|v| !v.is_empty());

        Ok(Config {
            model_dir,
            log_dir,
            llama_server_path,
            sd_server_path,
            llama_port,
            sd_port,
            gpu_layers,
            sd_model,
            server_start_timeout,
            server_stop_timeout,
            gpu_vram_bytes,
            gpu_kind,
        })
    }
}
