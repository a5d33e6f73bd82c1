//! Decides whether the two servers fit on the host at once and, when they
//! do not, evicts the text server for the duration of an image generation
//! and restores it afterwards.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AgentResult, ServerFault};
use crate::models::ModelCatalog;
use crate::supervisor::diffusion::{
    DiffusionSupervisor, ImageGenerationConfig, ImageGenerationResult,
};
use crate::supervisor::llama::LlamaSupervisor;
use crate::supervisor::{ServerConfig, ServerInfo, Supervisor};
use crate::system::SystemInfoSource;

/// Loaded weights cost more than their file size: KV cache, activations,
/// and allocator slack. Advisory, not measured.
const OVERHEAD_FACTOR: f64 = 1.2;
/// Fraction of capacity the two servers may claim together; the rest is
/// reserved for the OS and everything else on the box.
const HEADROOM: f64 = 0.75;
/// Divisor for the GPU-offload ratio when the model's real block count is
/// unknown.
const FALLBACK_TOTAL_LAYERS: u32 = 32;
/// Typical SDXL-class checkpoint, used before the image server has ever
/// been configured: 6.5 GiB.
const DEFAULT_DIFFUSION_MODEL_BYTES: u64 = 6_979_321_856;

/// Estimated bytes a running server pins. Zero vram means CPU-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceRequirements {
    pub ram: u64,
    pub vram: u64,
}

impl ResourceRequirements {
    const ZERO: ResourceRequirements = ResourceRequirements { ram: 0, vram: 0 };
}

/// Snapshot of the text server taken before eviction so it can be brought
/// back identically. Lives only while a restore is owed.
#[derive(Debug, Clone, Serialize)]
pub struct SavedLlmState {
    pub config: ServerConfig,
    pub was_running: bool,
    pub saved_at: DateTime<Utc>,
}

/// The orchestrator's view of the text server.
#[async_trait]
pub trait TextServerControl: Send + Sync {
    fn is_running(&self) -> bool;
    fn config(&self) -> Option<ServerConfig>;
    async fn stop(&self) -> AgentResult<()>;
    async fn start(&self, config: ServerConfig) -> AgentResult<ServerInfo>;
}

/// The orchestrator's view of the image server. `execute` is the raw
/// generation path; routing it back through [`ResourceOrchestrator`]
/// would recurse.
#[async_trait]
pub trait ImageServerControl: Send + Sync {
    fn config(&self) -> Option<ServerConfig>;
    async fn execute(&self, request: &ImageGenerationConfig) -> AgentResult<ImageGenerationResult>;
}

#[async_trait]
impl TextServerControl for LlamaSupervisor {
    fn is_running(&self) -> bool {
        let inner: &Supervisor = self;
        inner.is_running()
    }

    fn config(&self) -> Option<ServerConfig> {
        let inner: &Supervisor = self;
        inner.config()
    }

    async fn stop(&self) -> AgentResult<()> {
        let inner: &Supervisor = self;
        inner.stop().await
    }

    async fn start(&self, config: ServerConfig) -> AgentResult<ServerInfo> {
        let inner: &Supervisor = self;
        inner.start(config).await
    }
}

#[async_trait]
impl ImageServerControl for DiffusionSupervisor {
    fn config(&self) -> Option<ServerConfig> {
        let inner: &Supervisor = self;
        inner.config()
    }

    async fn execute(&self, request: &ImageGenerationConfig) -> AgentResult<ImageGenerationResult> {
        DiffusionSupervisor::execute(self, request).await
    }
}

/// Coordinates one image generation against the pair of supervisors.
/// Holds no back-references; both supervisors are injected at
/// construction and never learn about the orchestrator.
pub struct ResourceOrchestrator {
    llama: Arc<dyn TextServerControl>,
    diffusion: Arc<dyn ImageServerControl>,
    system: Arc<dyn SystemInfoSource>,
    catalog: Arc<ModelCatalog>,
    saved: Arc<StdMutex<Option<SavedLlmState>>>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl ResourceOrchestrator {
    pub fn new(
        llama: Arc<dyn TextServerControl>,
        diffusion: Arc<dyn ImageServerControl>,
        system: Arc<dyn SystemInfoSource>,
        catalog: Arc<ModelCatalog>,
    ) -> Self {
        ResourceOrchestrator {
            llama,
            diffusion,
            system,
            catalog,
            saved: Arc::new(StdMutex::new(None)),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Footprint of the text server as currently configured. Unknowns
    /// estimate to zero so a guess can never justify an eviction.
    pub fn estimate_llm(&self) -> ResourceRequirements {
        if !self.llama.is_running() {
            return ResourceRequirements::ZERO;
        }
        let Some(config) = self.llama.config() else {
            return ResourceRequirements::ZERO;
        };
        let artifact = match self.catalog.resolve(&config.model_id) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!("cannot size text model '{}': {}", config.model_id, e);
                return ResourceRequirements::ZERO;
            }
        };

        let total_layers = artifact.layer_count.unwrap_or(FALLBACK_TOTAL_LAYERS).max(1);
        let gpu_layers = config.gpu_layers.unwrap_or(0);
        let gpu_ratio = if gpu_layers == 0 {
            0.0
        } else {
            (gpu_layers as f64 / total_layers as f64).min(1.0)
        };

        let size = artifact.size_bytes as f64;
        ResourceRequirements {
            ram: (size * (1.0 - gpu_ratio) * OVERHEAD_FACTOR).round() as u64,
            vram: (size * gpu_ratio * OVERHEAD_FACTOR).round() as u64,
        }
    }

    /// Footprint of the image server. Before it has ever been configured,
    /// a typical checkpoint size stands in.
    pub fn estimate_diffusion(&self) -> ResourceRequirements {
        let size = self
            .diffusion
            .config()
            .and_then(|c| self.catalog.resolve(&c.model_id).ok())
            .map(|a| a.size_bytes)
            .unwrap_or(DEFAULT_DIFFUSION_MODEL_BYTES);
        let bytes = (size as f64 * OVERHEAD_FACTOR).round() as u64;
        ResourceRequirements {
            ram: bytes,
            vram: bytes,
        }
    }

    /// Pure predicate: would running both servers at once blow past the
    /// headroom? Safe to call with either server stopped.
    pub fn would_need_offload(&self) -> bool {
        let llm = self.estimate_llm();
        let diffusion = self.estimate_diffusion();
        let snapshot = self.system.snapshot();

        match snapshot.gpu {
            Some(gpu) if gpu.vram_total > 0 => {
                let budget = (gpu.vram_total as f64 * HEADROOM) as u64;
                llm.vram + diffusion.vram > budget
            }
            _ => {
                let budget = (snapshot.memory.available as f64 * HEADROOM) as u64;
                llm.ram + diffusion.ram > budget
            }
        }
    }

    /// Run one image generation, evicting the text server first when the
    /// two do not fit, and restoring it afterwards no matter how the
    /// generation went.
    ///
    /// Concurrent calls are rejected; callers queue externally. A pending
    /// saved state from an earlier failed restore also blocks new work
    /// until it is restored or explicitly cleared.
    pub async fn orchestrate(
        &self,
        request: ImageGenerationConfig,
    ) -> AgentResult<ImageGenerationResult> {
        let gate = Arc::clone(&self.gate)
            .try_lock_owned()
            .map_err(|_| ServerFault::Busy)?;

        if self.saved.lock().unwrap().is_some() {
            return Err(ServerFault::RestorePending.into());
        }

        let needs = self.would_need_offload();
        let llm_running = self.llama.is_running();
        if !(needs && llm_running) {
            tracing::debug!("both servers fit, generating without eviction");
            let result = self.diffusion.execute(&request).await;
            drop(gate);
            return result;
        }

        let config = self
            .llama
            .config()
            .ok_or(ServerFault::CannotOffload)?;
        *self.saved.lock().unwrap() = Some(SavedLlmState {
            config: config.clone(),
            was_running: true,
            saved_at: Utc::now(),
        });
        tracing::info!(
            "evicting text server (model '{}') for image generation",
            config.model_id
        );

        // The whole evict-generate-restore sequence runs in its own task:
        // cancelling the caller must not cancel the restore.
        let llama = Arc::clone(&self.llama);
        let diffusion = Arc::clone(&self.diffusion);
        let saved = Arc::clone(&self.saved);
        let task = tokio::spawn(async move {
            let _gate = gate;

            if let Err(e) = llama.stop().await {
                // eviction never happened; nothing to restore
                saved.lock().unwrap().take();
                return Err(e);
            }

            let outcome = diffusion.execute(&request).await;

            match llama.start(config).await {
                Ok(_) => {
                    saved.lock().unwrap().take();
                    tracing::info!("text server restored after image generation");
                }
                Err(e) => {
                    tracing::error!(
                        "failed to restore text server after image generation: {e}; \
                         saved state retained for retry"
                    );
                }
            }

            outcome
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ServerFault::Other(format!("orchestration task failed: {e}")).into()),
        }
    }

    pub fn saved_state(&self) -> Option<SavedLlmState> {
        self.saved.lock().unwrap().clone()
    }

    /// Drop a retained snapshot. No-op when nothing is saved.
    pub fn clear_saved_state(&self) {
        self.saved.lock().unwrap().take();
    }

    /// Retry bringing the text server back from a retained snapshot.
    /// Returns false when there is nothing to restore.
    pub async fn restore_saved(&self) -> AgentResult<bool> {
        let _gate = self.gate.try_lock().map_err(|_| ServerFault::Busy)?;
        let Some(saved) = self.saved.lock().unwrap().clone() else {
            return Ok(false);
        };
        self.llama.start(saved.config).await?;
        self.saved.lock().unwrap().take();
        tracing::info!("text server restored from saved state");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{GpuInfo, MemoryInfo, StaticSystemInfo, SystemSnapshot};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    type Trace = Arc<StdMutex<Vec<&'static str>>>;

    struct FakeLlm {
        running: StdMutex<bool>,
        config: StdMutex<Option<ServerConfig>>,
        starts: AtomicUsize,
        fail_start: AtomicBool,
        trace: Trace,
    }

    impl FakeLlm {
        fn new(config: Option<ServerConfig>, running: bool, trace: Trace) -> Self {
            FakeLlm {
                running: StdMutex::new(running),
                config: StdMutex::new(config),
                starts: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
                trace,
            }
        }
    }

    #[async_trait]
    impl TextServerControl for FakeLlm {
        fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }

        fn config(&self) -> Option<ServerConfig> {
            self.config.lock().unwrap().clone()
        }

        async fn stop(&self) -> AgentResult<()> {
            *self.running.lock().unwrap() = false;
            self.trace.lock().unwrap().push("llm-stop");
            Ok(())
        }

        async fn start(&self, config: ServerConfig) -> AgentResult<ServerInfo> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ServerFault::StartupTimeout { timeout_secs: 60 }.into());
            }
            *self.running.lock().unwrap() = true;
            *self.config.lock().unwrap() = Some(config.clone());
            self.trace.lock().unwrap().push("llm-start");
            Ok(ServerInfo {
                status: crate::supervisor::ServerStatus::Running,
                health: crate::health::HealthStatus::Ok,
                pid: Some(4242),
                port: config.port,
                model_id: config.model_id,
                started_at: Some(Utc::now()),
                error: None,
            })
        }
    }

    struct FakeDiffusion {
        config: Option<ServerConfig>,
        fail: bool,
        delay: Duration,
        trace: Trace,
    }

    #[async_trait]
    impl ImageServerControl for FakeDiffusion {
        fn config(&self) -> Option<ServerConfig> {
            self.config.clone()
        }

        async fn execute(
            &self,
            _request: &ImageGenerationConfig,
        ) -> AgentResult<ImageGenerationResult> {
            tokio::time::sleep(self.delay).await;
            self.trace.lock().unwrap().push("diffusion-execute");
            if self.fail {
                return Err(ServerFault::Other("sampler exploded".into()).into());
            }
            Ok(ImageGenerationResult {
                image: vec![0x89, 0x50, 0x4e, 0x47],
                format: "png",
                time_taken_ms: 12,
                seed: 42,
                width: 512,
                height: 512,
            })
        }
    }

    /// A model file of an exact logical size, sparse on disk.
    fn model_file(dir: &TempDir, name: &str, size: u64) -> String {
        let path = dir.path().join(name);
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path.display().to_string()
    }

    fn gpu_host(vram_total: u64) -> Arc<StaticSystemInfo> {
        Arc::new(StaticSystemInfo(SystemSnapshot {
            cpu_count: 16,
            memory: MemoryInfo {
                total: 32 << 30,
                available: 24 << 30,
            },
            gpu: Some(GpuInfo {
                vram_total,
                kind: "cuda".into(),
            }),
        }))
    }

    fn cpu_host(available: u64) -> Arc<StaticSystemInfo> {
        Arc::new(StaticSystemInfo(SystemSnapshot {
            cpu_count: 8,
            memory: MemoryInfo {
                total: available * 2,
                available,
            },
            gpu: None,
        }))
    }

    struct Rig {
        orchestrator: ResourceOrchestrator,
        llama: Arc<FakeLlm>,
        trace: Trace,
        _dir: TempDir,
    }

    /// Scenario-2 shaped rig: 8 GiB GPU, 6 GiB text model fully
    /// offloaded, image server unconfigured (6.5 GiB default).
    fn eviction_rig(diffusion_fail: bool, diffusion_delay: Duration) -> Rig {
        let dir = TempDir::new().unwrap();
        let model = model_file(&dir, "big-llm.gguf", 6 << 30);
        let mut config = ServerConfig::new(model, 8080);
        config.gpu_layers = Some(32);

        let trace: Trace = Arc::new(StdMutex::new(Vec::new()));
        let llama = Arc::new(FakeLlm::new(Some(config), true, Arc::clone(&trace)));
        let diffusion = Arc::new(FakeDiffusion {
            config: None,
            fail: diffusion_fail,
            delay: diffusion_delay,
            trace: Arc::clone(&trace),
        });
        let orchestrator = ResourceOrchestrator::new(
            Arc::clone(&llama) as Arc<dyn TextServerControl>,
            diffusion,
            gpu_host(8 << 30),
            Arc::new(ModelCatalog::new(dir.path())),
        );
        Rig {
            orchestrator,
            llama,
            trace,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn no_eviction_when_everything_fits() {
        let dir = TempDir::new().unwrap();
        let trace: Trace = Arc::new(StdMutex::new(Vec::new()));
        let llama = Arc::new(FakeLlm::new(None, false, Arc::clone(&trace)));
        let diffusion = Arc::new(FakeDiffusion {
            config: None,
            fail: false,
            delay: Duration::ZERO,
            trace: Arc::clone(&trace),
        });
        let orchestrator = ResourceOrchestrator::new(
            Arc::clone(&llama) as Arc<dyn TextServerControl>,
            diffusion,
            cpu_host(16 << 30),
            Arc::new(ModelCatalog::new(dir.path())),
        );

        assert!(!orchestrator.would_need_offload());
        let result = orchestrator
            .orchestrate(ImageGenerationConfig::new("a cat"))
            .await
            .unwrap();
        assert_eq!(result.format, "png");
        assert!(orchestrator.saved_state().is_none());
        assert_eq!(llama.starts.load(Ordering::SeqCst), 0);
        assert_eq!(*trace.lock().unwrap(), vec!["diffusion-execute"]);
    }

    #[tokio::test]
    async fn eviction_stops_generates_then_restores() {
        let rig = eviction_rig(false, Duration::ZERO);
        assert!(rig.orchestrator.would_need_offload());

        let result = rig
            .orchestrator
            .orchestrate(ImageGenerationConfig::new("a cat"))
            .await
            .unwrap();
        assert_eq!(result.seed, 42);
        assert!(rig.orchestrator.saved_state().is_none());
        assert!(rig.llama.is_running());
        assert_eq!(
            *rig.trace.lock().unwrap(),
            vec!["llm-stop", "diffusion-execute", "llm-start"]
        );
    }

    #[tokio::test]
    async fn diffusion_failure_still_restores() {
        let rig = eviction_rig(true, Duration::ZERO);

        let err = rig
            .orchestrator
            .orchestrate(ImageGenerationConfig::new("a cat"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sampler exploded"));
        assert!(rig.orchestrator.saved_state().is_none());
        assert!(rig.llama.is_running());
        assert_eq!(
            *rig.trace.lock().unwrap(),
            vec!["llm-stop", "diffusion-execute", "llm-start"]
        );
    }

    #[tokio::test]
    async fn restore_failure_retains_saved_state() {
        let rig = eviction_rig(false, Duration::ZERO);
        rig.llama.fail_start.store(true, Ordering::SeqCst);

        let result = rig
            .orchestrator
            .orchestrate(ImageGenerationConfig::new("a cat"))
            .await
            .unwrap();
        assert_eq!(result.seed, 42);

        let saved = rig.orchestrator.saved_state().expect("saved state retained");
        assert!(saved.was_running);
        assert_eq!(saved.config.gpu_layers, Some(32));
        assert!(!rig.llama.is_running());

        // a new orchestration is refused until the operator deals with it
        let err = rig
            .orchestrator
            .orchestrate(ImageGenerationConfig::new("another"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pending restore"));

        // retry path brings the server back and clears the slot
        rig.llama.fail_start.store(false, Ordering::SeqCst);
        assert!(rig.orchestrator.restore_saved().await.unwrap());
        assert!(rig.orchestrator.saved_state().is_none());
        assert!(rig.llama.is_running());

        // nothing left to restore now
        assert!(!rig.orchestrator.restore_saved().await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_orchestrations_are_rejected() {
        let rig = eviction_rig(false, Duration::from_millis(300));

        let first = rig.orchestrator.orchestrate(ImageGenerationConfig::new("slow one"));
        tokio::pin!(first);
        // drive it far enough to take the gate; the generation itself is slow
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut first)
                .await
                .is_err(),
            "generation should still be in flight"
        );

        let err = rig
            .orchestrator
            .orchestrate(ImageGenerationConfig::new("impatient"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already in flight"));

        first.await.unwrap();
        assert!(rig.orchestrator.saved_state().is_none());
    }

    #[tokio::test]
    async fn running_llm_without_config_cannot_offload() {
        let dir = TempDir::new().unwrap();
        let model = model_file(&dir, "big-llm.gguf", 6 << 30);
        let trace: Trace = Arc::new(StdMutex::new(Vec::new()));
        // running but config unknown: still counts toward nothing, so force
        // the predicate with a configured diffusion model instead
        let llama = Arc::new(FakeLlm::new(None, true, Arc::clone(&trace)));
        let diffusion = Arc::new(FakeDiffusion {
            config: Some(ServerConfig::new(model, 8081)),
            fail: false,
            delay: Duration::ZERO,
            trace: Arc::clone(&trace),
        });
        let orchestrator = ResourceOrchestrator::new(
            Arc::clone(&llama) as Arc<dyn TextServerControl>,
            diffusion,
            gpu_host(4 << 30),
            Arc::new(ModelCatalog::new(dir.path())),
        );

        assert!(orchestrator.would_need_offload());
        let err = orchestrator
            .orchestrate(ImageGenerationConfig::new("a cat"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without a configuration"));
        assert!(orchestrator.saved_state().is_none());
    }

    #[tokio::test]
    async fn headroom_boundary_is_strict() {
        let dir = TempDir::new().unwrap();
        let model = model_file(&dir, "sd.safetensors", 6250);
        let trace: Trace = Arc::new(StdMutex::new(Vec::new()));
        let llama = Arc::new(FakeLlm::new(None, false, Arc::clone(&trace)));
        let diffusion = Arc::new(FakeDiffusion {
            config: Some(ServerConfig::new(model.clone(), 8081)),
            fail: false,
            delay: Duration::ZERO,
            trace: Arc::clone(&trace),
        });
        let catalog = Arc::new(ModelCatalog::new(dir.path()));

        // diffusion need = 6250 * 1.2 = 7500 bytes; budget = 0.75 * 10000
        let at_boundary = ResourceOrchestrator::new(
            Arc::clone(&llama) as Arc<dyn TextServerControl>,
            Arc::clone(&diffusion) as Arc<dyn ImageServerControl>,
            cpu_host(10_000),
            Arc::clone(&catalog),
        );
        assert_eq!(at_boundary.estimate_diffusion().ram, 7_500);
        assert!(!at_boundary.would_need_offload());

        let past_boundary = ResourceOrchestrator::new(
            llama,
            diffusion,
            cpu_host(9_999),
            catalog,
        );
        assert!(past_boundary.would_need_offload());
    }

    #[tokio::test]
    async fn estimates_split_by_gpu_ratio() {
        let dir = TempDir::new().unwrap();
        let model = model_file(&dir, "llm.gguf", 1_000_000);
        let trace: Trace = Arc::new(StdMutex::new(Vec::new()));
        let mut config = ServerConfig::new(model, 8080);
        config.gpu_layers = Some(16); // half of the 32-layer fallback

        let llama = Arc::new(FakeLlm::new(Some(config), true, Arc::clone(&trace)));
        let diffusion = Arc::new(FakeDiffusion {
            config: None,
            fail: false,
            delay: Duration::ZERO,
            trace,
        });
        let orchestrator = ResourceOrchestrator::new(
            llama,
            diffusion,
            gpu_host(8 << 30),
            Arc::new(ModelCatalog::new(dir.path())),
        );

        let estimate = orchestrator.estimate_llm();
        assert_eq!(estimate.vram, 600_000);
        assert_eq!(estimate.ram, 600_000);

        // an unresolvable model estimates to zero rather than guessing
        let dir2 = TempDir::new().unwrap();
        let trace2: Trace = Arc::new(StdMutex::new(Vec::new()));
        let llama = Arc::new(FakeLlm::new(
            Some(ServerConfig::new("ghost-model", 8080)),
            true,
            Arc::clone(&trace2),
        ));
        let diffusion = Arc::new(FakeDiffusion {
            config: None,
            fail: false,
            delay: Duration::ZERO,
            trace: trace2,
        });
        let orchestrator = ResourceOrchestrator::new(
            llama,
            diffusion,
            gpu_host(8 << 30),
            Arc::new(ModelCatalog::new(dir2.path())),
        );
        assert_eq!(orchestrator.estimate_llm(), ResourceRequirements::ZERO);
    }

    #[tokio::test]
    async fn clear_saved_state_is_idempotent() {
        let rig = eviction_rig(false, Duration::ZERO);
        rig.orchestrator.clear_saved_state();
        rig.orchestrator.clear_saved_state();
        assert!(rig.orchestrator.saved_state().is_none());
    }
}
