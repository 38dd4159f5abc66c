/// 日次の生データキャッシュ（ワンショット生成パス専用）。
///
/// 1 日 1 ファイルで、取得日・取得時刻・取得したアイテム一覧をそのまま保存する。
/// 直近数日分のファイルから「最近見た ID」を集め、日をまたいだ重複掲載を防ぐ。
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::models::{Item, PERIOD_FORMAT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFetchCache {
    pub date: String,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub struct RawCacheDir {
    dir: PathBuf,
}

impl RawCacheDir {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("raw-{}.json", date.format(PERIOD_FORMAT)))
    }

    /// 指定日のキャッシュを丸ごと書き出す。
    ///
    /// # Errors
    /// ディレクトリ作成・エンコード・書き込みに失敗した場合はエラーを返す。
    pub async fn write(
        &self,
        date: NaiveDate,
        fetched_at: DateTime<Utc>,
        items: &[Item],
    ) -> Result<PathBuf> {
        let path = self.path_for(date);
        let cache = RawFetchCache {
            date: date.format(PERIOD_FORMAT).to_string(),
            fetched_at,
            items: items.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&cache).context("failed to encode raw fetch cache")?;

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write raw fetch cache {}", path.display()))?;

        debug!(path = %path.display(), items = items.len(), "raw fetch cache written");
        Ok(path)
    }

    /// 指定日のキャッシュを読む。存在しなければ `Ok(None)`。
    ///
    /// # Errors
    /// 読み込みまたは JSON のパースに失敗した場合はエラーを返す。
    pub async fn read(&self, date: NaiveDate) -> Result<Option<RawFetchCache>> {
        read_cache_file(&self.path_for(date)).await
    }

    /// `today` を含まない直近 `lookback_days` 日分のキャッシュに現れた ID を集める。
    ///
    /// 読めないファイルは警告を出して読み飛ばす。
    pub async fn recent_ids(&self, today: NaiveDate, lookback_days: u32) -> HashSet<String> {
        let mut ids = HashSet::new();
        for offset in 1..=u64::from(lookback_days) {
            let Some(date) = today.checked_sub_days(Days::new(offset)) else {
                break;
            };
            match self.read(date).await {
                Ok(Some(cache)) => ids.extend(cache.items.into_iter().map(|item| item.id)),
                Ok(None) => {}
                Err(error) => {
                    warn!(%date, error = %format!("{error:#}"), "skipping unreadable raw fetch cache");
                }
            }
        }
        ids
    }
}

async fn read_cache_file(path: &Path) -> Result<Option<RawFetchCache>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let cache = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse raw fetch cache {}", path.display()))?;
    Ok(Some(cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            title: "t".to_string(),
            content: String::new(),
            node_name: "tech".to_string(),
            node_title: String::new(),
            author: String::new(),
            replies: 3,
            created: Utc::now(),
            url: None,
        }
    }

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir().expect("tempdir");
        let cache = RawCacheDir::new(dir.path());
        let fetched_at = Utc::now();

        let path = cache
            .write(date("2025-11-08"), fetched_at, &[item("1")])
            .await
            .expect("write");
        assert!(path.ends_with("raw-2025-11-08.json"));

        let loaded = cache
            .read(date("2025-11-08"))
            .await
            .expect("read")
            .expect("present");
        assert_eq!(loaded.date, "2025-11-08");
        assert_eq!(loaded.items.len(), 1);
    }

    #[tokio::test]
    async fn recent_ids_excludes_today_and_old_days() {
        let dir = tempdir().expect("tempdir");
        let cache = RawCacheDir::new(dir.path());
        let now = Utc::now();
        cache.write(date("2025-11-08"), now, &[item("today")]).await.expect("write");
        cache.write(date("2025-11-07"), now, &[item("yesterday")]).await.expect("write");
        cache.write(date("2025-11-06"), now, &[item("two-days")]).await.expect("write");
        cache.write(date("2025-11-05"), now, &[item("too-old")]).await.expect("write");

        let ids = cache.recent_ids(date("2025-11-08"), 2).await;

        assert!(ids.contains("yesterday"));
        assert!(ids.contains("two-days"));
        assert!(!ids.contains("today"));
        assert!(!ids.contains("too-old"));
    }

    #[tokio::test]
    async fn recent_ids_skips_corrupt_files() {
        let dir = tempdir().expect("tempdir");
        let cache = RawCacheDir::new(dir.path());
        tokio::fs::write(cache.path_for(date("2025-11-07")), b"nope")
            .await
            .expect("write");

        let ids = cache.recent_ids(date("2025-11-08"), 1).await;
        assert!(ids.is_empty());
    }
}
