//! `ConfigSnapshot`: the immutable shape the core accepts from the (external)
//! configuration layer. The core never mutates this in place -- only whole
//! replacement via `Engine::reload_config`.

use crate::error::{EngineError, EngineResult};
use crate::model::{Endpoint, Region};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(with = "millis", rename = "schedulerIntervalMs")]
    pub scheduler_interval: Duration,
    pub retention_days: u32,
    pub worker_pool_size: usize,
    pub data_dir: PathBuf,
    pub export_dir: PathBuf,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            regions: Vec::new(),
            endpoints: Vec::new(),
            scheduler_interval: Duration::from_secs(300),
            retention_days: 30,
            worker_pool_size: (4 * cpus).min(32),
            data_dir: PathBuf::from("./data"),
            export_dir: PathBuf::from("./data/exports"),
        }
    }
}

impl ConfigSnapshot {
    /// Loads a snapshot from a TOML or JSON file, sniffed by extension.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::storage(path, e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)
                .map_err(|e| EngineError::validation(format!("invalid TOML config: {e}"))),
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| EngineError::validation(format!("invalid JSON config: {e}"))),
            other => Err(EngineError::validation(format!(
                "unrecognized config extension: {other:?}"
            ))),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.scheduler_interval < Duration::from_secs(60)
            || self.scheduler_interval > Duration::from_secs(24 * 3600)
        {
            return Err(EngineError::validation(
                "schedulerInterval must be between 1 minute and 24 hours",
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(EngineError::validation("workerPoolSize must be > 0"));
        }
        for endpoint in &self.endpoints {
            if !endpoint.timeout_is_valid() {
                return Err(EngineError::validation(format!(
                    "endpoint {} has an out-of-range timeout",
                    endpoint.id
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.enabled)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ConfigSnapshot::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.worker_pool_size <= 32);
    }

    #[test]
    fn rejects_short_interval() {
        let mut cfg = ConfigSnapshot::default();
        cfg.scheduler_interval = Duration::from_secs(10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = ConfigSnapshot::default();
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        let loaded = ConfigSnapshot::load(&path).unwrap();
        assert_eq!(loaded.retention_days, cfg.retention_days);
    }
}
