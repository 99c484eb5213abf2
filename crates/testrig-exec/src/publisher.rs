//! Result publishing seam.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

/// Takes report files once the engine is done with them.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, files: &[PathBuf]) -> anyhow::Result<()>;
}

/// Copies report files into a drop directory.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    target: PathBuf,
}

impl DirectoryPublisher {
    /// Publisher copying reports into `target`, created on demand.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Directory reports are copied into.
    pub fn target(&self) -> &Path {
        &self.target
    }
}

#[async_trait]
impl ResultPublisher for DirectoryPublisher {
    async fn publish(&self, files: &[PathBuf]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.target)
            .await
            .with_context(|| format!("failed to create {}", self.target.display()))?;
        for file in files {
            let name = file
                .file_name()
                .with_context(|| format!("report path {} has no file name", file.display()))?;
            let dest = self.target.join(name);
            tokio::fs::copy(file, &dest)
                .await
                .with_context(|| format!("failed to copy {} to {}", file.display(), dest.display()))?;
        }
        info!(count = files.len(), target = %self.target.display(), "published test results");
        Ok(())
    }
}

/// Leaves reports where the engine wrote them and logs their paths.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl ResultPublisher for LogPublisher {
    async fn publish(&self, files: &[PathBuf]) -> anyhow::Result<()> {
        for file in files {
            info!(report = %file.display(), "test results available");
        }
        Ok(())
    }
}
