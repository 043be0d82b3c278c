use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Next-offset checkpoint for one fetch run, stored as a plain-text integer.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    path: PathBuf,
    page_size: u64,
}

impl ProgressTracker {
    pub fn new(path: impl Into<PathBuf>, page_size: u64) -> Self {
        Self {
            path: path.into(),
            page_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset to resume from. Anything that is not a non-negative multiple of
    /// the page size (missing, garbage, negative, misaligned) reads as 0.
    pub fn load(&self) -> u64 {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return 0;
        };
        match raw.trim().parse::<u64>() {
            Ok(offset) if self.page_size > 0 && offset % self.page_size == 0 => offset,
            _ => {
                tracing::warn!(
                    path = %self.path.display(),
                    value = raw.trim(),
                    "ignoring non-conforming checkpoint; starting from 0"
                );
                0
            }
        }
    }

    /// Persist `offset` via a temp file and rename so a crash never leaves a
    /// half-written checkpoint.
    pub async fn save(&self, offset: u64) -> Result<()> {
        anyhow::ensure!(
            self.page_size > 0 && offset % self.page_size == 0,
            "checkpoint {offset} is not a multiple of page size {}",
            self.page_size
        );
        let tmp = self.path.with_extension("progress.tmp");
        tokio::fs::write(&tmp, offset.to_string())
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
