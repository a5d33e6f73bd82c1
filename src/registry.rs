use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::supervisor::diffusion::{ImageGenerationConfig, ImageGenerationResult};

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RESULT_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationStatus::Complete | GenerationStatus::Error)
    }
}

/// One tracked image-generation job.
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub id: String,
    pub status: GenerationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: ImageGenerationConfig,
    pub result: Option<ImageGenerationResult>,
    pub error: Option<String>,
    /// Monotonic twin of `updated_at`, used for reaping.
    touched: Instant,
}

/// Partial update merged into a [`GenerationState`].
#[derive(Debug, Default)]
pub struct GenerationUpdate {
    pub status: Option<GenerationStatus>,
    pub result: Option<ImageGenerationResult>,
    pub error: Option<String>,
}

/// In-memory table of generation jobs. Terminal entries are reaped by a
/// background task once they outlive `max_result_age`; pending and
/// running jobs are never reaped.
pub struct GenerationRegistry {
    entries: Arc<StdMutex<HashMap<String, GenerationState>>>,
    max_result_age: Duration,
    cancel: CancellationToken,
}

impl GenerationRegistry {
    /// Requires a tokio runtime; the reaper is spawned immediately.
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_RESULT_AGE)
    }

    pub fn with_settings(cleanup_interval: Duration, max_result_age: Duration) -> Self {
        let entries: Arc<StdMutex<HashMap<String, GenerationState>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        {
            let entries = Arc::clone(&entries);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cleanup_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            let reaped = reap(&entries, max_result_age);
                            if reaped > 0 {
                                tracing::debug!("reaped {} finished generation entries", reaped);
                            }
                        }
                    }
                }
            });
        }

        GenerationRegistry {
            entries,
            max_result_age,
            cancel,
        }
    }

    pub fn create(&self, config: ImageGenerationConfig) -> String {
        let id = generate_id();
        let now = Utc::now();
        let state = GenerationState {
            id: id.clone(),
            status: GenerationStatus::Pending,
            created_at: now,
            updated_at: now,
            config,
            result: None,
            error: None,
            touched: Instant::now(),
        };
        self.entries.lock().unwrap().insert(id.clone(), state);
        id
    }

    pub fn get(&self, id: &str) -> Option<GenerationState> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    /// Merge a delta and bump `updated_at`. Unknown ids are ignored.
    pub fn update(&self, id: &str, delta: GenerationUpdate) {
        let mut entries = self.entries.lock().unwrap();
        let Some(state) = entries.get_mut(id) else {
            return;
        };
        if let Some(status) = delta.status {
            state.status = status;
        }
        if let Some(result) = delta.result {
            state.result = Some(result);
        }
        if let Some(error) = delta.error {
            state.error = Some(error);
        }
        state.updated_at = Utc::now();
        state.touched = Instant::now();
    }

    pub fn delete(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// One reaper pass, also exposed for deterministic tests.
    pub fn reap_now(&self) -> usize {
        reap(&self.entries, self.max_result_age)
    }

    /// Stop the background reaper. The table itself stays usable.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }
}

impl Default for GenerationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GenerationRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn reap(entries: &StdMutex<HashMap<String, GenerationState>>, max_age: Duration) -> usize {
    let mut entries = entries.lock().unwrap();
    let before = entries.len();
    entries.retain(|_, state| !(state.status.is_terminal() && state.touched.elapsed() > max_age));
    before - entries.len()
}

/// `gen_{epoch_ms}_{9 base36 chars}`; collision odds are negligible.
fn generate_id() -> String {
    format!("gen_{}_{}", Utc::now().timestamp_millis(), base36_suffix())
}

fn base36_suffix() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    const LEN: usize = 9;
    let mut value = uuid::Uuid::new_v4().as_u128();
    let mut out = [0u8; LEN];
    for slot in out.iter_mut() {
        *slot = ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ImageGenerationConfig {
        ImageGenerationConfig::new("a lighthouse at dusk")
    }

    #[test]
    fn id_format() {
        let id = generate_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "gen");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(generate_id(), generate_id());
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let registry = GenerationRegistry::new();
        let id = registry.create(request());
        let state = registry.get(&id).unwrap();
        assert_eq!(state.status, GenerationStatus::Pending);
        assert_eq!(state.config, request());
        assert_eq!(state.created_at, state.updated_at);
        assert_eq!(registry.size(), 1);
        registry.destroy();
    }

    #[tokio::test]
    async fn update_merges_and_bumps() {
        let registry = GenerationRegistry::new();
        let id = registry.create(request());

        registry.update(
            &id,
            GenerationUpdate {
                status: Some(GenerationStatus::Error),
                error: Some("cuda out of memory".into()),
                ..Default::default()
            },
        );
        let state = registry.get(&id).unwrap();
        assert_eq!(state.status, GenerationStatus::Error);
        assert_eq!(state.error.as_deref(), Some("cuda out of memory"));
        assert!(state.updated_at >= state.created_at);

        // unknown id is silently ignored
        registry.update("gen_0_zzzzzzzzz", GenerationUpdate::default());
        registry.destroy();
    }

    #[tokio::test]
    async fn reaper_only_takes_old_terminal_entries() {
        let registry =
            GenerationRegistry::with_settings(Duration::from_secs(3600), Duration::ZERO);

        let done = registry.create(request());
        registry.update(
            &done,
            GenerationUpdate {
                status: Some(GenerationStatus::Complete),
                ..Default::default()
            },
        );
        let busy = registry.create(request());
        registry.update(
            &busy,
            GenerationUpdate {
                status: Some(GenerationStatus::Running),
                ..Default::default()
            },
        );

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.reap_now(), 1);
        assert!(registry.get(&done).is_none());
        assert!(registry.get(&busy).is_some());

        // a second pass over the same table is a no-op
        assert_eq!(registry.reap_now(), 0);
        registry.destroy();
    }

    #[tokio::test]
    async fn fresh_terminal_entries_survive() {
        let registry =
            GenerationRegistry::with_settings(Duration::from_secs(3600), Duration::from_secs(300));
        let id = registry.create(request());
        registry.update(
            &id,
            GenerationUpdate {
                status: Some(GenerationStatus::Complete),
                ..Default::default()
            },
        );
        assert_eq!(registry.reap_now(), 0);
        assert!(registry.get(&id).is_some());
        registry.destroy();
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let registry = GenerationRegistry::new();
        let id = registry.create(request());
        assert!(registry.delete(&id));
        assert!(!registry.delete(&id));
        registry.create(request());
        registry.clear();
        assert_eq!(registry.size(), 0);
        registry.destroy();
    }
}
