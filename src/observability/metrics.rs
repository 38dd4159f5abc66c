/// Prometheusメトリクス定義。
use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub items_fetched: Counter,
    pub items_upserted: Counter,
    pub fetch_failures: Counter,
    pub collector_ticks: Counter,
    pub builder_ticks: Counter,
    pub digests_published: Counter,
    pub digests_pending: Counter,
    pub digest_failures: Counter,
    pub persist_failures: Counter,
    pub empty_summaries: Counter,

    // ヒストグラム
    pub collector_tick_duration: Histogram,
    pub builder_tick_duration: Histogram,

    // ゲージ
    pub stored_items: Gauge,
    pub skip_markers: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同名のメトリクスが既に登録されている場合はエラーを返す。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            items_fetched: register_counter_with_registry!(
                "digest_items_fetched_total",
                "Total number of items returned by sources",
                registry
            )?,
            items_upserted: register_counter_with_registry!(
                "digest_items_upserted_total",
                "Total number of items written to the ranked store",
                registry
            )?,
            fetch_failures: register_counter_with_registry!(
                "digest_fetch_failures_total",
                "Total number of source fetches that failed",
                registry
            )?,
            collector_ticks: register_counter_with_registry!(
                "digest_collector_ticks_total",
                "Total number of collector ticks",
                registry
            )?,
            builder_ticks: register_counter_with_registry!(
                "digest_builder_ticks_total",
                "Total number of builder ticks",
                registry
            )?,
            digests_published: register_counter_with_registry!(
                "digest_published_total",
                "Total number of digests published",
                registry
            )?,
            digests_pending: register_counter_with_registry!(
                "digest_pending_total",
                "Builder ticks that found too few qualifying items",
                registry
            )?,
            digest_failures: register_counter_with_registry!(
                "digest_failures_total",
                "Builder ticks that failed before publishing",
                registry
            )?,
            persist_failures: register_counter_with_registry!(
                "digest_persist_failures_total",
                "Total number of snapshot writes that failed",
                registry
            )?,
            empty_summaries: register_counter_with_registry!(
                "digest_empty_summaries_total",
                "Summaries that came back empty",
                registry
            )?,
            collector_tick_duration: register_histogram_with_registry!(
                "digest_collector_tick_duration_seconds",
                "Duration of a collector tick",
                registry
            )?,
            builder_tick_duration: register_histogram_with_registry!(
                "digest_builder_tick_duration_seconds",
                "Duration of a builder tick",
                registry
            )?,
            stored_items: register_gauge_with_registry!(
                "digest_stored_items",
                "Items currently held in the ranked store",
                registry
            )?,
            skip_markers: register_gauge_with_registry!(
                "digest_skip_markers",
                "Skip markers currently held in the ranked store",
                registry
            )?,
        })
    }
}
