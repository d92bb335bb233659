use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{ReconcileError, Result};
use crate::pipeline::processing::quality::WeightingPolicy;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub batch: BatchSettings,
    pub quality: QualitySettings,
    pub sync: SyncSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_concurrency: usize,
    pub chunk_size: usize,
    pub max_parallel_batches: usize,
    pub fail_fast: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            chunk_size: 10,
            max_parallel_batches: 2,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub policy: WeightingPolicy,
    pub trend_window: usize,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            policy: WeightingPolicy::Balanced,
            trend_window: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub default_strategy: String,
    /// Records per millisecond assumed before any session has finished
    pub default_throughput_per_ms: f64,
    pub history_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            default_strategy: "merge".to_string(),
            default_throughput_per_ms: 5.0,
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub directory: String,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            file_prefix: "bookshelf-sync.log".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the file does not exist.
    /// Environment overrides are applied last.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                ReconcileError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
            })?;
            Self::from_toml_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("BOOKSHELF_MAX_CONCURRENCY") {
            self.batch.max_concurrency = parse_env("BOOKSHELF_MAX_CONCURRENCY", &v)?;
        }
        if let Ok(v) = std::env::var("BOOKSHELF_CHUNK_SIZE") {
            self.batch.chunk_size = parse_env("BOOKSHELF_CHUNK_SIZE", &v)?;
        }
        if let Ok(v) = std::env::var("BOOKSHELF_QUALITY_POLICY") {
            self.quality.policy = v.parse()?;
        }
        self.check()
    }

    fn check(&self) -> Result<()> {
        if self.batch.max_concurrency == 0 || self.batch.chunk_size == 0 || self.batch.max_parallel_batches == 0 {
            return Err(ReconcileError::Config(
                "batch concurrency, chunk size and parallel batches must be at least 1".to_string(),
            ));
        }
        if !(self.sync.default_throughput_per_ms > 0.0) {
            return Err(ReconcileError::Config(
                "sync.default_throughput_per_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| ReconcileError::Config(format!("{} must be a positive integer, got '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [batch]
            max_concurrency = 8

            [quality]
            policy = "strict"
            "#,
        )
        .unwrap();
        assert_eq!(config.batch.max_concurrency, 8);
        assert_eq!(config.batch.chunk_size, 10);
        assert_eq!(config.quality.policy, WeightingPolicy::Strict);
        assert_eq!(config.sync.default_strategy, "merge");
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let err = Config::from_toml_str("[batch]\nchunk_size = 0\n").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.directory, "logs");
    }
}
