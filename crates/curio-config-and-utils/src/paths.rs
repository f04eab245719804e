//! File system paths for the SDK's local state.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Manages file system paths under the SDK base directory.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.curio)
    base_dir: PathBuf,
}

impl Paths {
    /// Paths rooted at `~/.curio`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".curio"),
        })
    }

    /// Paths rooted at a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Config file path (~/.curio/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// SQLite file holding the offline and periodic queues (~/.curio/curio.sqlite).
    pub fn database_file(&self) -> PathBuf {
        self.base_dir.join("curio.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// JSONL log file (~/.curio/logs/curio.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("curio.jsonl")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
