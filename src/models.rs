use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AgentError, AgentResult};

const MODEL_EXTENSIONS: &[&str] = &["gguf", "safetensors"];

/// A locally available model file.
#[derive(Debug, Clone)]
pub struct LocalModel {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// A resolved model: the file a server will be pointed at, plus what is
/// known about its shape.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub model_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Transformer block count, when a metadata sidecar provides it.
    pub layer_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ModelSidecar {
    #[serde(alias = "block_count")]
    layer_count: Option<u32>,
}

/// Resolves model ids against a flat on-disk model directory. Download and
/// checksum pipelines live elsewhere; this is the lookup side only.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    model_dir: PathBuf,
}

impl ModelCatalog {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        ModelCatalog {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Resolve a model id to a file. Absolute paths are accepted as-is;
    /// otherwise the model directory is searched with and without known
    /// extensions.
    pub fn resolve(&self, model_id: &str) -> AgentResult<ModelArtifact> {
        if model_id.is_empty() {
            return Err(AgentError::ModelNotFound {
                model_id: model_id.to_string(),
            });
        }

        let as_path = Path::new(model_id);
        if as_path.is_absolute() && as_path.is_file() {
            return self.artifact(model_id, as_path.to_path_buf());
        }

        let mut candidates = vec![self.model_dir.join(model_id)];
        for ext in MODEL_EXTENSIONS {
            candidates.push(self.model_dir.join(format!("{model_id}.{ext}")));
        }

        for candidate in candidates {
            if candidate.is_file() {
                return self.artifact(model_id, candidate);
            }
        }

        Err(AgentError::ModelNotFound {
            model_id: model_id.to_string(),
        })
    }

    fn artifact(&self, model_id: &str, path: PathBuf) -> AgentResult<ModelArtifact> {
        let metadata = fs::metadata(&path).map_err(|e| AgentError::FileSystem {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(ModelArtifact {
            model_id: model_id.to_string(),
            layer_count: read_layer_count(&path),
            size_bytes: metadata.len(),
            path,
        })
    }

    /// List model files in the directory, sorted by name. A missing
    /// directory reads as empty.
    pub fn list(&self) -> AgentResult<Vec<LocalModel>> {
        if !self.model_dir.exists() {
            tracing::info!("model directory does not exist: {}", self.model_dir.display());
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.model_dir).map_err(|e| AgentError::FileSystem {
            path: self.model_dir.display().to_string(),
            source: e,
        })?;

        let mut models = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AgentError::FileSystem {
                path: self.model_dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !MODEL_EXTENSIONS.contains(&ext) {
                continue;
            }
            let metadata = fs::metadata(&path).map_err(|e| AgentError::FileSystem {
                path: path.display().to_string(),
                source: e,
            })?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            models.push(LocalModel {
                name,
                path,
                size_bytes: metadata.len(),
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }
}

/// Look for `<file>.meta.json` next to the model and pull the layer count
/// out of it. Absence is normal; estimation falls back to a fixed divisor.
fn read_layer_count(model_path: &Path) -> Option<u32> {
    let sidecar = model_path.with_extension("meta.json");
    let raw = fs::read_to_string(sidecar).ok()?;
    let parsed: ModelSidecar = serde_json::from_str(&raw).ok()?;
    parsed.layer_count
}

/// Format bytes into a human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_by_id_and_extension() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tiny.gguf"), vec![0u8; 1024]).unwrap();
        let catalog = ModelCatalog::new(dir.path());

        let artifact = catalog.resolve("tiny").unwrap();
        assert_eq!(artifact.size_bytes, 1024);
        assert!(artifact.layer_count.is_none());

        let artifact = catalog.resolve("tiny.gguf").unwrap();
        assert_eq!(artifact.model_id, "tiny.gguf");
    }

    #[test]
    fn resolve_unknown_is_model_not_found() {
        let dir = tempdir().unwrap();
        let catalog = ModelCatalog::new(dir.path());
        let err = catalog.resolve("missing").unwrap_err();
        assert_eq!(err.code(), "MODEL_NOT_FOUND");
    }

    #[test]
    fn sidecar_layer_count() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("llama.gguf"), vec![0u8; 16]).unwrap();
        fs::write(dir.path().join("llama.meta.json"), r#"{"layer_count": 28}"#).unwrap();
        let catalog = ModelCatalog::new(dir.path());
        assert_eq!(catalog.resolve("llama").unwrap().layer_count, Some(28));
    }

    #[test]
    fn list_skips_foreign_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.gguf"), b"x").unwrap();
        fs::write(dir.path().join("a.safetensors"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let catalog = ModelCatalog::new(dir.path());
        let names: Vec<String> = catalog.list().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(6979321856), "6.5 GB");
    }
}
