use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AgentResult, ServerFault};
use crate::logsink::LogSink;
use crate::models::ModelCatalog;
use crate::supervisor::{ProgressStage, ServerConfig, ServerEvent, ServerSpec, Supervisor};

/// An image generation can legitimately take minutes on CPU.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(600);

pub const DEFAULT_WIDTH: u32 = 512;
pub const DEFAULT_HEIGHT: u32 = 512;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_CFG_SCALE: f32 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampler {
    EulerA,
    Euler,
    Heun,
    Dpm2,
    #[serde(rename = "dpm++2m")]
    Dpmpp2m,
    Lcm,
}

impl Sampler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sampler::EulerA => "euler_a",
            Sampler::Euler => "euler",
            Sampler::Heun => "heun",
            Sampler::Dpm2 => "dpm2",
            Sampler::Dpmpp2m => "dpm++2m",
            Sampler::Lcm => "lcm",
        }
    }
}

/// One image request as the caller phrases it. Unset knobs take the
/// server-side defaults above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGenerationConfig {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f32>,
    pub seed: Option<i64>,
    pub sampler: Option<Sampler>,
}

impl ImageGenerationConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        ImageGenerationConfig {
            prompt: prompt.into(),
            negative_prompt: None,
            width: None,
            height: None,
            steps: None,
            cfg_scale: None,
            seed: None,
            sampler: None,
        }
    }

    pub fn validate(&self) -> AgentResult<()> {
        if self.prompt.is_empty() {
            return Err(ServerFault::Other("image request has an empty prompt".into()).into());
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(ServerFault::Other("image dimensions must be positive".into()).into());
        }
        if self.steps == Some(0) {
            return Err(ServerFault::Other("step count must be at least 1".into()).into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ImageGenerationResult {
    pub image: Vec<u8>,
    pub format: &'static str,
    pub time_taken_ms: u64,
    /// The seed actually used, never the "random" sentinel.
    pub seed: i64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize)]
struct TxtToImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    cfg_scale: f32,
    seed: i64,
    sample_method: &'a str,
    batch_count: u32,
}

#[derive(Debug, Deserialize)]
struct TxtToImgImage {
    data: String,
    seed: Option<i64>,
}

/// stable-diffusion.cpp's `sd-server`: loopback HTTP image generation.
pub struct DiffusionSpec {
    binary: PathBuf,
    default_port: u16,
}

impl ServerSpec for DiffusionSpec {
    fn name(&self) -> &'static str {
        "sd-server"
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
        args
    }
}

/// Supervisor for the image-generation server, plus the raw generation
/// path the orchestrator drives. `execute` is deliberately not the
/// orchestrated entry point; it never evicts anything.
pub struct DiffusionSupervisor {
    inner: Supervisor,
    client: reqwest::Client,
    base_config: Option<ServerConfig>,
}

impl DiffusionSupervisor {
    pub fn new(config: &Config, catalog: Arc<ModelCatalog>) -> Self {
        let spec = DiffusionSpec {
            binary: config.sd_server_path.clone(),
            default_port: config.sd_port,
        };
        let sink = LogSink::new(config.log_dir.join("sd-server.log"));
        let base_config = config
            .sd_model
            .as_ref()
            .map(|model| ServerConfig::new(model.clone(), config.sd_port));
        DiffusionSupervisor {
            inner: Supervisor::new(
                Arc::new(spec),
                catalog,
                sink,
                config.server_start_timeout,
                config.server_stop_timeout,
            ),
            client: reqwest::Client::new(),
            base_config,
        }
    }

    /// Start the server if it is not already up, reusing the last config
    /// or falling back to the configured default model.
    pub async fn ensure_running(&self) -> AgentResult<()> {
        if self.inner.is_running() {
            return Ok(());
        }
        let config = self
            .inner
            .config()
            .or_else(|| self.base_config.clone())
            .ok_or(ServerFault::NoConfig)?;
        self.inner.start(config).await?;
        Ok(())
    }

    /// Run one generation against the live server. Progress is emitted as
    /// coarse stage transitions; per-step telemetry is the server's own
    /// business.
    pub async fn execute(&self, request: &ImageGenerationConfig) -> AgentResult<ImageGenerationResult> {
        request.validate()?;

        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        self.progress(0, steps, ProgressStage::Loading);
        self.ensure_running().await?;

        // running implies a config, but keep the failure typed
        let port = self
            .inner
            .config()
            .map(|c| c.port)
            .ok_or(ServerFault::NoConfig)?;

        let width = request.width.unwrap_or(DEFAULT_WIDTH);
        let height = request.height.unwrap_or(DEFAULT_HEIGHT);
        let seed = request.seed.filter(|s| *s >= 0).unwrap_or_else(random_seed);
        let negative = request.negative_prompt.as_deref().unwrap_or("");
        let sampler = request.sampler.unwrap_or(Sampler::EulerA);

        let body = TxtToImgRequest {
            prompt: &request.prompt,
            negative_prompt: negative,
            width,
            height,
            steps,
            cfg_scale: request.cfg_scale.unwrap_or(DEFAULT_CFG_SCALE),
            seed,
            sample_method: sampler.as_str(),
            batch_count: 1,
        };

        self.progress(0, steps, ProgressStage::Diffusion);
        let started = Instant::now();
        let (image, realized_seed) =
            post_txt2img(&self.client, port, &body, GENERATE_TIMEOUT).await?;
        self.progress(steps, steps, ProgressStage::Decoding);

        let result = ImageGenerationResult {
            image,
            format: "png",
            time_taken_ms: started.elapsed().as_millis() as u64,
            seed: realized_seed.unwrap_or(seed),
            width,
            height,
        };
        tracing::info!(
            "generated {}x{} image in {} ms (seed {})",
            result.width,
            result.height,
            result.time_taken_ms,
            result.seed
        );
        Ok(result)
    }

    fn progress(&self, current_step: u32, total_steps: u32, stage: ProgressStage) {
        let percentage = if total_steps == 0 {
            0.0
        } else {
            current_step as f32 / total_steps as f32 * 100.0
        };
        self.inner.emit(ServerEvent::Progress {
            current_step,
            total_steps,
            stage,
            percentage,
        });
    }
}

impl Deref for DiffusionSupervisor {
    type Target = Supervisor;

    fn deref(&self) -> &Supervisor {
        &self.inner
    }
}

/// POST the request to `/txt2img` and decode the first returned image.
async fn post_txt2img(
    client: &reqwest::Client,
    port: u16,
    body: &TxtToImgRequest<'_>,
    timeout: Duration,
) -> AgentResult<(Vec<u8>, Option<i64>)> {
    let url = format!("http://127.0.0.1:{}/txt2img", port);
    let response = client
        .post(&url)
        .json(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ServerFault::Other(format!("image generation request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(ServerFault::Other(format!(
            "image generation failed: HTTP {status}: {text}"
        ))
        .into());
    }

    let images: Vec<TxtToImgImage> = response
        .json()
        .await
        .map_err(|e| ServerFault::Other(format!("unreadable generation response: {e}")))?;
    let first = images
        .into_iter()
        .next()
        .ok_or_else(|| ServerFault::Other("generation response contained no images".into()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(first.data.as_bytes())
        .map_err(|e| ServerFault::Other(format!("image payload is not valid base64: {e}")))?;
    Ok((bytes, first.seed))
}

/// Positive 32-bit seed derived from process-local entropy.
fn random_seed() -> i64 {
    (uuid::Uuid::new_v4().as_u128() % i32::MAX as u128) as i64
}
