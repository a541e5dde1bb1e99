use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Server-level configuration: where pipeline state is kept.
///
/// Redis wins when reachable; otherwise `QUIP_STATE_DIR` selects file
/// storage; with neither, state lives in memory for the life of the process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379").
    pub redis_url: Option<String>,
    /// Directory for file-backed state.
    pub state_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Optional:
    /// - `REDIS_URL`: Redis connection string
    /// - `QUIP_STATE_DIR`: directory for file storage, created on first write
    pub fn from_env() -> Result<Self, AppError> {
        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let state_dir = std::env::var("QUIP_STATE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| validate_state_dir(Path::new(&s)))
            .transpose()?;

        Ok(Self {
            redis_url,
            state_dir,
        })
    }
}

fn validate_state_dir(path: &Path) -> Result<PathBuf, AppError> {
    if path.exists() && !path.is_dir() {
        return Err(AppError::Config(format!(
            "QUIP_STATE_DIR {} exists and is not a directory",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}
