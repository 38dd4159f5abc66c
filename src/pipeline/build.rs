//! Builder tick: select qualifying candidates for the current period and
//! publish at most one digest per (channel, period).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::clients::Summarizer;
use crate::observability::metrics::Metrics;
use crate::pipeline::compose::compose_digest;
use crate::pipeline::output::DigestSink;
use crate::scheduler::PeriodicTask;
use crate::store::{Period, RankedStore, ScoredItem};

/// 候補プールは `top_n` のこの倍数だけストアから読み出す。
const CANDIDATE_POOL_FACTOR: usize = 5;

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub channel: String,
    pub title: String,
    pub language: String,
    pub top_n: usize,
    pub min_items: usize,
    pub skip_ttl: Duration,
    pub excluded_nodes: Vec<String>,
    pub summary_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    AlreadyPublished,
    Pending {
        qualifying: usize,
        required: usize,
    },
    Published {
        item_ids: Vec<String>,
        location: String,
    },
}

pub struct DigestBuilder {
    store: Arc<RankedStore>,
    summarizer: Arc<dyn Summarizer>,
    sink: Arc<dyn DigestSink>,
    settings: BuilderSettings,
    excluded: HashSet<String>,
    metrics: Arc<Metrics>,
}

impl DigestBuilder {
    #[must_use]
    pub fn new(
        store: Arc<RankedStore>,
        summarizer: Arc<dyn Summarizer>,
        sink: Arc<dyn DigestSink>,
        settings: BuilderSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let excluded = settings
            .excluded_nodes
            .iter()
            .map(|node| node.to_lowercase())
            .collect();
        Self {
            store,
            summarizer,
            sink,
            settings,
            excluded,
            metrics,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    /// 除外ノード・スキップ中・返信なし・スコア 0 以下を落とした候補一覧。
    #[must_use]
    pub fn qualifying_candidates(&self, period: &Period) -> Vec<ScoredItem> {
        let pool_size = self.settings.top_n.saturating_mul(CANDIDATE_POOL_FACTOR);
        self.store
            .top_n(period, pool_size)
            .into_iter()
            .filter(|c| !self.excluded.contains(&c.item.node_name.to_lowercase()))
            .filter(|c| !self.store.is_skipped(&self.settings.channel, &c.item.id))
            .filter(|c| c.item.replies > 0 && c.score > 0.0)
            .collect()
    }

    /// 現在の期間について 1 回分の判定と公開を行う。
    ///
    /// # Errors
    /// ダイジェストの書き出しに失敗した場合はエラーを返す。その場合マーカーは記録されない。
    pub async fn run_tick(&self) -> Result<BuildOutcome> {
        let channel = self.settings.channel.as_str();
        let period = self.store.current_period();

        if self.store.is_published(channel, &period) {
            info!(%channel, %period, "digest already published for period");
            return Ok(BuildOutcome::AlreadyPublished);
        }

        let candidates = self.qualifying_candidates(&period);
        if candidates.len() < self.settings.min_items {
            info!(
                %channel,
                %period,
                qualifying = candidates.len(),
                required = self.settings.min_items,
                "not enough qualifying items yet"
            );
            self.metrics.digests_pending.inc();
            return Ok(BuildOutcome::Pending {
                qualifying: candidates.len(),
                required: self.settings.min_items,
            });
        }

        let selected: Vec<ScoredItem> = candidates
            .into_iter()
            .take(self.settings.top_n)
            .collect();

        let composed = compose_digest(
            self.summarizer.as_ref(),
            &self.settings.title,
            period.as_str(),
            &self.settings.language,
            &selected,
            self.settings.summary_concurrency,
        )
        .await;
        if composed.empty_summaries > 0 {
            #[allow(clippy::cast_precision_loss)]
            self.metrics
                .empty_summaries
                .inc_by(composed.empty_summaries as f64);
        }

        let location = self
            .sink
            .write(&period, &composed.document)
            .await
            .with_context(|| format!("failed to write digest for {period}"))?;

        let item_ids: Vec<String> = selected.iter().map(|s| s.item.id.clone()).collect();
        if !self
            .store
            .commit_digest(channel, &period, &item_ids, self.settings.skip_ttl)
        {
            warn!(%channel, %period, "period was published concurrently, markers left unchanged");
            return Ok(BuildOutcome::AlreadyPublished);
        }
        self.metrics.digests_published.inc();
        info!(
            %channel,
            %period,
            items = item_ids.len(),
            %location,
            "digest published"
        );

        let gc = self.store.gc();
        info!(
            expired_skips = gc.expired_skips,
            dropped_periods = gc.dropped_periods,
            dropped_items = gc.dropped_items,
            "store gc completed"
        );
        if let Err(err) = self.store.persist().await {
            error!(%period, error = %err, "failed to persist store after publishing");
            self.metrics.persist_failures.inc();
        }

        Ok(BuildOutcome::Published { item_ids, location })
    }
}

#[async_trait]
impl PeriodicTask for DigestBuilder {
    fn name(&self) -> &'static str {
        "builder"
    }

    async fn tick(&self) {
        let started = Instant::now();
        self.metrics.builder_ticks.inc();
        if let Err(err) = self.run_tick().await {
            error!(error = %format!("{err:#}"), "builder tick failed");
            self.metrics.digest_failures.inc();
        }
        self.metrics
            .builder_tick_duration
            .observe(started.elapsed().as_secs_f64());
    }
}
