//! Cross-platform application paths

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathsError {
    #[error("could not determine data directory")]
    NoDataDir,
    #[error("failed to create {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    /// Resolve the data dir (`EMOSIM_DATA_DIR` wins over the OS default) and create it.
    pub fn new() -> Result<Self, PathsError> {
        let data_dir = match std::env::var_os("EMOSIM_DATA_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::data_dir().ok_or(PathsError::NoDataDir)?.join("emosim"),
        };
        Self::at(data_dir)
    }

    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self, PathsError> {
        let paths = Self {
            data_dir: data_dir.into(),
        };
        for dir in [paths.data_dir.clone(), paths.snapshot_dir()] {
            fs::create_dir_all(&dir).map_err(|source| PathsError::Create { path: dir, source })?;
        }
        Ok(paths)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// One JSON file per storage key.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }
}
