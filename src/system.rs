use serde::Serialize;

use crate::config::Config;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub vram_total: u64,
    pub kind: String,
}

/// Point-in-time view of the host the orchestrator budgets against.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub cpu_count: usize,
    pub memory: MemoryInfo,
    pub gpu: Option<GpuInfo>,
}

pub trait SystemInfoSource: Send + Sync {
    fn snapshot(&self) -> SystemSnapshot;
}

/// Live host probe. RAM and CPU come from the OS; VRAM capacity is
/// configured, since GPU introspection lives outside this agent.
#[derive(Debug, Clone)]
pub struct HostProbe {
    gpu: Option<GpuInfo>,
}

impl HostProbe {
    pub fn new(gpu: Option<GpuInfo>) -> Self {
        HostProbe { gpu }
    }

    pub fn from_config(config: &Config) -> Self {
        let gpu = config.gpu_vram_bytes.map(|vram_total| GpuInfo {
            vram_total,
            kind: config.gpu_kind.clone().unwrap_or_else(|| "unknown".to_string()),
        });
        HostProbe { gpu }
    }
}

impl SystemInfoSource for HostProbe {
    fn snapshot(&self) -> SystemSnapshot {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_memory();
        SystemSnapshot {
            cpu_count: sys.cpus().len(),
            memory: MemoryInfo {
                total: sys.total_memory(),
                available: sys.available_memory(),
            },
            gpu: self.gpu.clone(),
        }
    }
}

/// Fixed snapshot, for wiring tests and dry runs.
#[derive(Debug, Clone)]
pub struct StaticSystemInfo(pub SystemSnapshot);

impl SystemInfoSource for StaticSystemInfo {
    fn snapshot(&self) -> SystemSnapshot {
        self.0.clone()
    }
}
