use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::logsink::LogSink;
use crate::models::ModelCatalog;
use crate::supervisor::{ServerConfig, ServerSpec, Supervisor};

/// llama.cpp's `llama-server`: OpenAI-compatible text generation over
/// loopback HTTP, model loaded at startup.
pub struct LlamaSpec {
    binary: PathBuf,
    default_port: u16,
}

impl ServerSpec for LlamaSpec {
    fn name(&self) -> &'static str {
        "llama-server"
    }

    fn binary(&self) -> &Path {
        &self.binary
    }

    fn default_port(&self) -> u16 {
        self.default_port
    }

    fn build_args(&self, config: &ServerConfig, model_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            model_path.display().to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            config.port.to_string(),
        ];
        if let Some(threads) = config.threads {
            args.push("-t".to_string());
            args.push(threads.to_string());
        }
        if let Some(ctx) = config.context_size {
            args.push("--ctx-size".to_string());
            args.push(ctx.to_string());
        }
        if let Some(ngl) = config.gpu_layers {
            args.push("-ngl".to_string());
            args.push(ngl.to_string());
        }
        if let Some(parallel) = config.parallel_requests {
            args.push("--parallel".to_string());
            args.push(parallel.to_string());
        }
        if config.flash_attention == Some(true) {
            args.push("--flash-attn".to_string());
        }
        args
    }
}

/// Supervisor for the text-generation server.
pub struct LlamaSupervisor {
    inner: Supervisor,
}

impl LlamaSupervisor {
    pub fn new(config: &Config, catalog: Arc<ModelCatalog>) -> Self {
        let spec = LlamaSpec {
            binary: config.llama_server_path.clone(),
            default_port: config.llama_port,
        };
        let sink = LogSink::new(config.log_dir.join("llama-server.log"));
        LlamaSupervisor {
            inner: Supervisor::new(
                Arc::new(spec),
                catalog,
                sink,
                config.server_start_timeout,
                config.server_stop_timeout,
            ),
        }
    }
}

impl Deref for LlamaSupervisor {
    type Target = Supervisor;

    fn deref(&self) -> &Supervisor {
        &self.inner
    }
}
