use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

pub const DEFAULT_SNAPSHOT_VERSION: &str = "emosim-3";
pub const DEFAULT_STORAGE_KEY: &str = "emosim.snapshot.v3";

fn default_base_state_dim() -> usize {
    12
}

fn default_emotion_dim() -> usize {
    10
}

fn default_snapshot_version() -> String {
    DEFAULT_SNAPSHOT_VERSION.to_string()
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

fn default_target_fps() -> u32 {
    30
}

fn default_metrics_history() -> usize {
    256
}

/// Simulation knobs. Dimensions are fixed for the lifetime of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_base_state_dim")]
    pub base_state_dim: usize,
    #[serde(default = "default_emotion_dim")]
    pub emotion_dim: usize,
    /// Exact tag stamped on saved snapshots; loads with any other tag are rejected.
    #[serde(default = "default_snapshot_version")]
    pub snapshot_version: String,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// Samples kept by the metrics recorder.
    #[serde(default = "default_metrics_history")]
    pub metrics_history: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            base_state_dim: default_base_state_dim(),
            emotion_dim: default_emotion_dim(),
            snapshot_version: default_snapshot_version(),
            storage_key: default_storage_key(),
            target_fps: default_target_fps(),
            metrics_history: default_metrics_history(),
        }
    }
}

impl SimConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Apply `EMOSIM_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        // EMOSIM_BASE_STATE_DIM=12
        if let Some(n) = lookup("EMOSIM_BASE_STATE_DIM").and_then(|v| v.trim().parse().ok()) {
            self.base_state_dim = n;
        }
        // EMOSIM_EMOTION_DIM=10
        if let Some(n) = lookup("EMOSIM_EMOTION_DIM").and_then(|v| v.trim().parse().ok()) {
            self.emotion_dim = n;
        }
        if let Some(v) = lookup("EMOSIM_SNAPSHOT_VERSION") {
            let v = v.trim();
            if !v.is_empty() {
                self.snapshot_version = v.to_string();
            }
        }
        if let Some(v) = lookup("EMOSIM_STORAGE_KEY") {
            let v = v.trim();
            if !v.is_empty() {
                self.storage_key = v.to_string();
            }
        }
        // EMOSIM_TARGET_FPS=30
        if let Some(n) = lookup("EMOSIM_TARGET_FPS").and_then(|v| v.trim().parse::<u32>().ok()) {
            self.target_fps = n;
        }
        self.target_fps = self.target_fps.clamp(1, 240);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_state_dim == 0 {
            return Err(ConfigError::Invalid("base_state_dim must be > 0".into()));
        }
        if self.emotion_dim == 0 {
            return Err(ConfigError::Invalid("emotion_dim must be > 0".into()));
        }
        if self.snapshot_version.trim().is_empty() {
            return Err(ConfigError::Invalid("snapshot_version must not be empty".into()));
        }
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::Invalid("storage_key must not be empty".into()));
        }
        Ok(())
    }

    pub fn emotion_shape(&self) -> [usize; 2] {
        [1, self.emotion_dim]
    }

    pub fn frame_millis(&self) -> u64 {
        (1000 / self.target_fps.clamp(1, 240)).max(1) as u64
    }
}
