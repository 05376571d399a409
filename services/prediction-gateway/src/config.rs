use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::registry::{dir_size, RegistryError, BYTES_PER_MB};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub health_port: u16,
    /// Concurrent scores per batch; 0 scores sequentially.
    pub workers: usize,
    pub model_dir: PathBuf,
    /// Budget for the whole model directory, 1 MB = 1,000,000 bytes.
    pub max_memory_mb: u64,
    /// Result cache entries; 0 disables the cache.
    pub cache_capacity: usize,
    /// Result cache TTL; 0 disables the cache.
    pub cache_ttl_secs: u64,
    /// Per-row scoring timeout; 0 waits indefinitely.
    pub score_timeout_ms: u64,
    pub preload: bool,
    pub watch_models: bool,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            health_port: 9090,
            workers: 0,
            model_dir: PathBuf::from("../models/"),
            max_memory_mb: 64,
            cache_capacity: 0,
            cache_ttl_secs: 0,
            score_timeout_ms: 0,
            preload: true,
            watch_models: false,
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("model directory {0} does not exist")]
    MissingModelDir(PathBuf),
    #[error("model path {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("max_memory_mb must be greater than zero")]
    ZeroBudget,
    #[error("model directory {dir} holds {total} bytes, over the {budget} byte budget")]
    Oversize { dir: PathBuf, total: u64, budget: u64 },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl GatewayConfig {
    /// Defaults, then `CANOPY_CONFIG_FILE`, then `CANOPY__*` variables.
    pub fn load() -> anyhow::Result<Self> {
        canopy_core::load_config(crate::SERVICE, &Self::default())
    }

    pub fn budget_bytes(&self) -> u64 { self.max_memory_mb.saturating_mul(BYTES_PER_MB) }

    pub fn cache_ttl(&self) -> Duration { Duration::from_secs(self.cache_ttl_secs) }

    pub fn score_timeout(&self) -> Option<Duration> {
        (self.score_timeout_ms > 0).then(|| Duration::from_millis(self.score_timeout_ms))
    }

    /// Startup checks; the service refuses to start on any of these.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_model_dir(&self.model_dir)?;
        if self.max_memory_mb == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        let total = dir_size(&self.model_dir)?;
        if total > self.budget_bytes() {
            return Err(ConfigError::Oversize { dir: self.model_dir.clone(), total, budget: self.budget_bytes() });
        }
        Ok(())
    }
}

fn validate_model_dir(dir: &Path) -> Result<(), ConfigError> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ConfigError::NotADirectory(dir.to_path_buf())),
        Err(_) => Err(ConfigError::MissingModelDir(dir.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_dir(dir: &Path) -> GatewayConfig {
        GatewayConfig { model_dir: dir.to_path_buf(), ..Default::default() }
    }

    #[test]
    fn derived_values() {
        let cfg = GatewayConfig { max_memory_mb: 3, score_timeout_ms: 250, cache_ttl_secs: 5, ..Default::default() };
        assert_eq!(cfg.budget_bytes(), 3_000_000);
        assert_eq!(cfg.score_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(5));
        assert_eq!(GatewayConfig::default().score_timeout(), None);
    }

    #[test]
    fn validate_accepts_a_fitting_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.json"), b"{}").unwrap();
        with_dir(dir.path()).validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_directories_and_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.json");
        std::fs::write(&file, vec![0u8; 2_000]).unwrap();

        assert!(matches!(with_dir(&dir.path().join("missing")).validate(), Err(ConfigError::MissingModelDir(_))));
        assert!(matches!(with_dir(&file).validate(), Err(ConfigError::NotADirectory(_))));
        let zero = GatewayConfig { max_memory_mb: 0, ..with_dir(dir.path()) };
        assert!(matches!(zero.validate(), Err(ConfigError::ZeroBudget)));

        let big = dir.path().join("big.json");
        std::fs::File::create(&big).unwrap().set_len(2 * BYTES_PER_MB).unwrap();
        let small = GatewayConfig { max_memory_mb: 1, ..with_dir(dir.path()) };
        assert!(matches!(small.validate(), Err(ConfigError::Oversize { total: 2_002_000, .. })));
    }
}
