use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Infer a level from a server's own output line. The llama.cpp and
    /// sd.cpp binaries tag lines near the start, so only the prefix is
    /// inspected. Untagged stdout is info, untagged stderr is warn.
    pub fn infer(line: &str, from_stderr: bool) -> Self {
        let prefix: String = line.chars().take(24).collect::<String>().to_ascii_lowercase();
        if prefix.contains("error") {
            LogLevel::Error
        } else if prefix.contains("warn") {
            LogLevel::Warn
        } else if prefix.contains("debug") {
            LogLevel::Debug
        } else if prefix.contains("info") {
            LogLevel::Info
        } else if from_stderr {
            LogLevel::Warn
        } else {
            LogLevel::Info
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Append-only line log backed by a single file. No rotation; callers
/// clear on their own cadence.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LogSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the containing directory. Idempotent.
    pub fn initialize(&self) -> AgentResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AgentError::FileSystem {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    pub fn format(entry: &LogEntry) -> String {
        format!(
            "[{}] [{:<5}] {}\n",
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            entry.level.as_str(),
            entry.message
        )
    }

    pub fn append(&self, message: &str, level: LogLevel) -> AgentResult<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
        };
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| AgentError::FileSystem {
                path: self.path.display().to_string(),
                source: e,
            })?;
        file.write_all(Self::format(&entry).as_bytes())
            .map_err(|e| AgentError::FileSystem {
                path: self.path.display().to_string(),
                source: e,
            })?;
        Ok(())
    }

    /// Last `n` non-empty lines in file order. Missing file reads as empty.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let lines: Vec<&str> = raw.split('\n').filter(|l| !l.is_empty()).collect();
        let skip = lines.len().saturating_sub(n);
        lines[skip..].iter().map(|l| l.to_string()).collect()
    }

    /// Truncate the file to zero bytes.
    pub fn clear(&self) -> AgentResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        fs::write(&self.path, b"").map_err(|e| AgentError::FileSystem {
            path: self.path.display().to_string(),
            source: e,
        })
    }

    /// Round-trips the [`LogSink::format`] layout. Trailing whitespace
    /// (including CR) is stripped before matching; malformed lines yield None.
    pub fn parse(line: &str) -> Option<LogEntry> {
        let line = line.trim_end();
        let rest = line.strip_prefix('[')?;
        let ts_end = rest.find(']')?;
        let timestamp = DateTime::parse_from_rfc3339(&rest[..ts_end])
            .ok()?
            .with_timezone(&Utc);
        let rest = rest[ts_end + 1..].strip_prefix(" [")?;
        let lvl_end = rest.find(']')?;
        let level = LogLevel::parse(&rest[..lvl_end])?;
        let message = rest[lvl_end + 1..].strip_prefix(' ')?.to_string();
        Some(LogEntry {
            timestamp,
            level,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sink_in_tempdir() -> (tempfile::TempDir, LogSink) {
        let dir = tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("server.log"));
        sink.initialize().unwrap();
        (dir, sink)
    }

    #[test]
    fn format_parse_round_trip() {
        let entry = LogEntry {
            timestamp: "2026-08-01T10:00:00.123Z".parse().unwrap(),
            level: LogLevel::Warn,
            message: "slot 0 released".to_string(),
        };
        let line = LogSink::format(&entry);
        assert_eq!(line, "[2026-08-01T10:00:00.123Z] [WARN ] slot 0 released\n");
        assert_eq!(LogSink::parse(&line).unwrap(), entry);
    }

    #[test]
    fn parse_tolerates_crlf_and_rejects_garbage() {
        let line = "[2026-08-01T10:00:00.000Z] [ERROR] cuda out of memory\r\n";
        let entry = LogSink::parse(line).unwrap();
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "cuda out of memory");

        assert!(LogSink::parse("not a log line").is_none());
        assert!(LogSink::parse("[2026-08-01T10:00:00Z] [NOISE] x").is_none());
    }

    #[test]
    fn tail_returns_last_lines_in_order() {
        let (_dir, sink) = sink_in_tempdir();
        for i in 0..10 {
            sink.append(&format!("line {i}"), LogLevel::Info).unwrap();
        }
        let tail = sink.tail(3);
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with("line 7"));
        assert!(tail[2].ends_with("line 9"));

        assert!(sink.tail(0).is_empty());
        assert_eq!(sink.tail(100).len(), 10);
    }

    #[test]
    fn tail_on_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("nope.log"));
        assert!(sink.tail(10).is_empty());
    }

    #[test]
    fn clear_truncates() {
        let (_dir, sink) = sink_in_tempdir();
        sink.append("hello", LogLevel::Debug).unwrap();
        sink.clear().unwrap();
        assert!(sink.tail(10).is_empty());
        // clearing an already-missing file is fine too
        let dir = tempdir().unwrap();
        LogSink::new(dir.path().join("gone.log")).clear().unwrap();
    }

    #[test]
    fn level_inference() {
        assert_eq!(LogLevel::infer("ERROR: failed to load model", false), LogLevel::Error);
        assert_eq!(LogLevel::infer("warn: lora not found", false), LogLevel::Warn);
        assert_eq!(LogLevel::infer("[DEBUG] kv cache", false), LogLevel::Debug);
        assert_eq!(LogLevel::infer("llama_model_load: loading", false), LogLevel::Info);
        assert_eq!(LogLevel::infer("llama_model_load: loading", true), LogLevel::Warn);
    }
}
