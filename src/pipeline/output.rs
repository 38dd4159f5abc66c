//! Where rendered digests go.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::store::Period;

#[async_trait]
pub trait DigestSink: Send + Sync {
    /// 文書を書き出し、書き出し先を人が読める形で返す。
    async fn write(&self, period: &Period, document: &str) -> Result<String>;
}

/// `<dir>/<period>.md` に書き出すシンク。一時ファイル経由で置き換える。
#[derive(Debug, Clone)]
pub struct FileDigestSink {
    dir: PathBuf,
}

impl FileDigestSink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, period: &Period) -> PathBuf {
        self.dir.join(format!("{period}.md"))
    }
}

#[async_trait]
impl DigestSink for FileDigestSink {
    async fn write(&self, period: &Period, document: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create output dir {}", self.dir.display()))?;

        let path = self.path_for(period);
        let tmp = path.with_extension("md.tmp");
        tokio::fs::write(&tmp, document)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move digest into {}", path.display()))?;

        info!(path = %path.display(), bytes = document.len(), "digest written");
        Ok(path.display().to_string())
    }
}
