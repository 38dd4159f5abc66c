//! Collector tick: fetch every configured source, score, upsert, persist once.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::clients::SourceFetcher;
use crate::observability::metrics::Metrics;
use crate::pipeline::scoring::compute_score;
use crate::scheduler::PeriodicTask;
use crate::store::RankedStore;

/// 1 回の収集結果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub period: String,
    pub fetched: usize,
    pub upserted: usize,
    pub failed_sources: Vec<String>,
    pub persisted: bool,
}

pub struct Collector {
    store: Arc<RankedStore>,
    fetcher: Arc<dyn SourceFetcher>,
    sources: Vec<String>,
    metrics: Arc<Metrics>,
}

impl Collector {
    #[must_use]
    pub fn new(
        store: Arc<RankedStore>,
        fetcher: Arc<dyn SourceFetcher>,
        sources: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            fetcher,
            sources,
            metrics,
        }
    }

    /// 全ソースを順に取得してストアへ反映する。
    ///
    /// 個々のソースの失敗は記録して次へ進む。スナップショットは最後に一度だけ書き出す。
    pub async fn run_tick(&self) -> CollectReport {
        let started = Instant::now();
        self.metrics.collector_ticks.inc();

        let period = self.store.current_period();
        let mut report = CollectReport {
            period: period.to_string(),
            ..CollectReport::default()
        };

        for source in &self.sources {
            let items = match self.fetcher.fetch(source).await {
                Ok(items) => items,
                Err(err) => {
                    warn!(%source, error = %format!("{err:#}"), "source fetch failed, skipping");
                    self.metrics.fetch_failures.inc();
                    report.failed_sources.push(source.clone());
                    continue;
                }
            };

            report.fetched += items.len();
            #[allow(clippy::cast_precision_loss)]
            self.metrics.items_fetched.inc_by(items.len() as f64);

            // Scored against the clock at upsert time, not tick start.
            // Every stored item counts, whether or not its score was raised.
            let mut upserted = 0_usize;
            for item in items {
                let score = compute_score(&item, self.store.now());
                if score > 0.0 {
                    self.store.upsert(&period, item, score);
                    upserted += 1;
                }
            }
            report.upserted += upserted;
            #[allow(clippy::cast_precision_loss)]
            self.metrics.items_upserted.inc_by(upserted as f64);
            info!(%source, %period, upserted, "source collected");
        }

        match self.store.persist().await {
            Ok(()) => report.persisted = true,
            Err(err) => {
                error!(%period, error = %err, "failed to persist store after collection");
                self.metrics.persist_failures.inc();
            }
        }

        let stats = self.store.stats();
        #[allow(clippy::cast_precision_loss)]
        {
            self.metrics.stored_items.set(stats.items as f64);
            self.metrics.skip_markers.set(stats.skip_markers as f64);
        }
        self.metrics
            .collector_tick_duration
            .observe(started.elapsed().as_secs_f64());

        info!(
            %period,
            fetched = report.fetched,
            upserted = report.upserted,
            failed_sources = report.failed_sources.len(),
            "collector tick completed"
        );
        report
    }
}

#[async_trait]
impl PeriodicTask for Collector {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn tick(&self) {
        self.run_tick().await;
    }
}
