//! One-shot digest for today, independent of the ranked store.
//!
//! Fetches every source, caches the raw fetch for the day, drops ids seen in
//! the previous days' caches, ranks and renders.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::FixedOffset;
use thiserror::Error;
use tracing::{info, warn};

use crate::clients::{SourceFetcher, Summarizer};
use crate::pipeline::compose::compose_digest;
use crate::pipeline::rank::rank_top;
use crate::store::{Item, Period, RawCacheDir, ScoredItem};
use crate::util::time::Clock;

const HOURS_PER_DAY: u64 = 24;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("no items were fetched from any source")]
    NothingFetched,
    #[error("none of the {fetched} fetched items qualified for the digest")]
    NothingQualified { fetched: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct GenerateSettings {
    pub sources: Vec<String>,
    pub top_n: usize,
    pub skip_hours: u64,
    pub excluded_nodes: Vec<String>,
    pub title: String,
    pub language: String,
    pub summary_concurrency: usize,
    pub offset: FixedOffset,
}

#[derive(Debug, Clone)]
pub struct GeneratedDigest {
    pub period: Period,
    pub document: String,
    pub items: Vec<ScoredItem>,
    pub cache_path: Option<PathBuf>,
}

pub struct OneShotGenerator {
    fetcher: Arc<dyn SourceFetcher>,
    summarizer: Arc<dyn Summarizer>,
    cache: RawCacheDir,
    clock: Arc<dyn Clock>,
    settings: GenerateSettings,
}

/// `ceil(skip_hours / 24)`。
#[must_use]
pub fn lookback_days(skip_hours: u64) -> u32 {
    u32::try_from(skip_hours.div_ceil(HOURS_PER_DAY)).unwrap_or(u32::MAX)
}

impl OneShotGenerator {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        summarizer: Arc<dyn Summarizer>,
        cache: RawCacheDir,
        clock: Arc<dyn Clock>,
        settings: GenerateSettings,
    ) -> Self {
        Self {
            fetcher,
            summarizer,
            cache,
            clock,
            settings,
        }
    }

    /// # Errors
    /// どのソースからも取得できなかった場合は [`GenerateError::NothingFetched`]、
    /// 候補が残らなかった場合は [`GenerateError::NothingQualified`] を返す。
    pub async fn generate(&self) -> Result<GeneratedDigest, GenerateError> {
        let now = self.clock.now();
        let today = now.with_timezone(&self.settings.offset).date_naive();
        let period = Period::from_date(today);

        let mut fetched: Vec<Item> = Vec::new();
        for source in &self.settings.sources {
            match self.fetcher.fetch(source).await {
                Ok(items) => {
                    info!(%source, count = items.len(), "source fetched");
                    fetched.extend(items);
                }
                Err(err) => {
                    warn!(%source, error = %format!("{err:#}"), "source fetch failed, skipping");
                }
            }
        }
        if fetched.is_empty() {
            return Err(GenerateError::NothingFetched);
        }

        let cache_path = match self.cache.write(today, now, &fetched).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to write raw fetch cache");
                None
            }
        };

        let recent = self
            .cache
            .recent_ids(today, lookback_days(self.settings.skip_hours))
            .await;
        let ranked = rank_top(
            &fetched,
            self.settings.top_n,
            &recent,
            &self.settings.excluded_nodes,
            now,
        );
        if ranked.is_empty() {
            return Err(GenerateError::NothingQualified {
                fetched: fetched.len(),
            });
        }
        info!(
            %period,
            fetched = fetched.len(),
            recently_seen = recent.len(),
            selected = ranked.len(),
            "one-shot ranking completed"
        );

        let composed = compose_digest(
            self.summarizer.as_ref(),
            &self.settings.title,
            period.as_str(),
            &self.settings.language,
            &ranked,
            self.settings.summary_concurrency,
        )
        .await;

        Ok(GeneratedDigest {
            period,
            document: composed.document,
            items: ranked,
            cache_path,
        })
    }
}
