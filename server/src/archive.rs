//! Where finished match logs go.

use async_trait::async_trait;
use log::info;
use shared::MatchId;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("log host rejected the upload: {0}")]
    Rejected(String),

    #[error("log host unavailable: {0}")]
    Unavailable(String),
}

/// Publishes a finished log to a log host and returns its id there.
#[async_trait]
pub trait LogUploader: Send + Sync {
    async fn upload(&self, title: &str, map: &str, contents: &str) -> Result<u64, UploadError>;
}

/// Local-disk fallback for match logs.
#[derive(Debug, Clone)]
pub struct LogArchive {
    dir: PathBuf,
}

impl LogArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, match_id: MatchId) -> PathBuf {
        self.dir.join(format!("{}.log", match_id))
    }

    /// Writes `<dir>/<match_id>.log`, replacing any earlier file.
    pub async fn write(&self, match_id: MatchId, contents: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(match_id);
        tokio::fs::write(&path, contents).await?;
        info!("#{}: log archived to {}", match_id, path.display());
        Ok(path)
    }
}
