use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    api,
    clients::{
        LlmSummarizer, LlmSummarizerConfig, NoopSummarizer, SourceClient, SourceClientConfig,
        SourceFetcher, Summarizer,
    },
    config::Config,
    observability::Telemetry,
    pipeline::{
        BuilderSettings, Collector, DigestBuilder, DigestSink, FileDigestSink, GenerateSettings,
        OneShotGenerator,
    },
    scheduler::{PeriodicTask, spawn_periodic},
    store::{LoadOutcome, RankedStore, RawCacheDir},
    util::time::{Clock, SystemClock},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    clock: Arc<dyn Clock>,
    store: Arc<RankedStore>,
    load_outcome: LoadOutcome,
    fetcher: Arc<dyn SourceFetcher>,
    summarizer: Arc<dyn Summarizer>,
    sink: Arc<dyn DigestSink>,
    collector: Arc<Collector>,
    builder: Arc<DigestBuilder>,
    shutdown_token: CancellationToken,
}

impl AppState {
    pub(crate) fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self { registry }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn store(&self) -> &RankedStore {
        &self.registry.store
    }

    pub(crate) fn builder(&self) -> &DigestBuilder {
        &self.registry.builder
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.registry.shutdown_token
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// # Errors
    /// Telemetry の初期化や HTTP クライアント構築が失敗した場合はエラーを返す。
    pub async fn build(config: Config) -> Result<Self> {
        let telemetry = Telemetry::new()?;
        Self::build_with(config, telemetry, Arc::new(SystemClock)).await
    }

    /// Telemetry と時計を差し替えて構築する。
    ///
    /// # Errors
    /// HTTP クライアント構築が失敗した場合はエラーを返す。
    pub async fn build_with(
        config: Config,
        telemetry: Telemetry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = telemetry.metrics();

        let store = Arc::new(RankedStore::new(
            config.snapshot_path(),
            Arc::clone(&clock),
            config.tz_offset(),
        ));
        let load_outcome = store.load().await;
        info!(?load_outcome, stats = ?store.stats(), "ranked store ready");

        let fetcher: Arc<dyn SourceFetcher> = Arc::new(
            SourceClient::new(SourceClientConfig {
                base_url: config.source_base_url().to_string(),
                connect_timeout: config.source_connect_timeout(),
                total_timeout: config.source_total_timeout(),
                retry: config.retry_config(),
            })
            .context("failed to build source client")?,
        );

        let summarizer: Arc<dyn Summarizer> = if config.ai_enabled() {
            Arc::new(
                LlmSummarizer::new(LlmSummarizerConfig {
                    base_url: config.ai_base_url().to_string(),
                    api_key: config.ai_api_key().map(ToString::to_string),
                    model: config.ai_model().to_string(),
                    timeout: config.ai_timeout(),
                    max_input_graphemes: config.ai_max_input_graphemes(),
                })
                .context("failed to build summarizer client")?,
            )
        } else {
            info!("AI summarization disabled, digests will carry no summaries");
            Arc::new(NoopSummarizer)
        };

        let sink: Arc<dyn DigestSink> = Arc::new(FileDigestSink::new(config.output_dir()));

        let collector = Arc::new(Collector::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            config.sources().to_vec(),
            Arc::clone(&metrics),
        ));
        let builder = Arc::new(DigestBuilder::new(
            Arc::clone(&store),
            Arc::clone(&summarizer),
            Arc::clone(&sink),
            BuilderSettings {
                channel: config.channel().to_string(),
                title: config.digest_title().to_string(),
                language: config.language().to_string(),
                top_n: config.top_n(),
                min_items: config.min_items(),
                skip_ttl: config.skip_ttl(),
                excluded_nodes: config.excluded_nodes().to_vec(),
                summary_concurrency: config.ai_max_concurrency().get(),
            },
            metrics,
        ));

        Ok(Self {
            config,
            telemetry,
            clock,
            store,
            load_outcome,
            fetcher,
            summarizer,
            sink,
            collector,
            builder,
            shutdown_token: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn store(&self) -> Arc<RankedStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn load_outcome(&self) -> LoadOutcome {
        self.load_outcome
    }

    #[must_use]
    pub fn collector(&self) -> Arc<Collector> {
        Arc::clone(&self.collector)
    }

    #[must_use]
    pub fn builder(&self) -> Arc<DigestBuilder> {
        Arc::clone(&self.builder)
    }

    #[must_use]
    pub fn sink(&self) -> Arc<dyn DigestSink> {
        Arc::clone(&self.sink)
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// ストアを経由しないワンショット生成器を組み立てる。
    #[must_use]
    pub fn one_shot_generator(&self) -> OneShotGenerator {
        OneShotGenerator::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.summarizer),
            RawCacheDir::new(self.config.cache_dir()),
            Arc::clone(&self.clock),
            GenerateSettings {
                sources: self.config.sources().to_vec(),
                top_n: self.config.top_n(),
                skip_hours: self.config.skip_hours(),
                excluded_nodes: self.config.excluded_nodes().to_vec(),
                title: self.config.digest_title().to_string(),
                language: self.config.language().to_string(),
                summary_concurrency: self.config.ai_max_concurrency().get(),
                offset: self.config.tz_offset(),
            },
        )
    }
}

pub fn build_router(registry: Arc<ComponentRegistry>) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}

/// HTTP 制御プレーンと収集・生成タスクを起動し、停止シグナルまで動かす。
///
/// 停止時はトークンを取り消し、実行中のティックの完了を待ってからストアを一度だけ永続化する。
///
/// # Errors
/// リスナーのバインド、または停止時の永続化が失敗した場合はエラーを返す。
pub async fn serve<F>(registry: Arc<ComponentRegistry>, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = registry.config();
    let shutdown_token = registry.shutdown_token();

    // Bind first so a startup failure never leaves a tick running.
    let bind_addr = config.http_bind();
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    info!(%bind_addr, "listening");

    let collector = spawn_periodic(
        registry.collector() as Arc<dyn PeriodicTask>,
        config.collector_interval(),
        shutdown_token.child_token(),
    );
    let builder = spawn_periodic(
        registry.builder() as Arc<dyn PeriodicTask>,
        config.builder_interval(),
        shutdown_token.child_token(),
    );

    let router = build_router(Arc::clone(&registry));
    let server_shutdown = shutdown_token.clone();
    if let Err(error) = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = signal => {}
                () = server_shutdown.cancelled() => {}
            }
            server_shutdown.cancel();
        })
        .await
    {
        warn!(error = %error, "server exited with error");
    }
    shutdown_token.cancel();

    for (name, handle) in [("collector", collector), ("builder", builder)] {
        if let Err(error) = handle.await {
            error!(task = name, %error, "periodic task ended abnormally");
        }
    }

    registry
        .store()
        .persist()
        .await
        .context("failed to persist store during shutdown")?;
    info!(stats = ?registry.store().stats(), "store persisted, shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLayers;
    use std::time::Duration;

    async fn registry_with_bind(dir: &std::path::Path, bind: &str) -> ComponentRegistry {
        let yaml = format!(
            "SOURCE_BASE_URL: http://localhost:9/\nDIGEST_SNAPSHOT_PATH: {}\nDIGEST_WORKER_HTTP_BIND: \"{bind}\"\n",
            dir.join("store.json").display()
        );
        let layers = ConfigLayers::from_yaml(&yaml).expect("yaml").without_env();
        let config = Config::from_layers(&layers).expect("config loads");
        ComponentRegistry::build_with(
            config,
            Telemetry::without_tracing().expect("telemetry"),
            Arc::new(SystemClock),
        )
        .await
        .expect("registry builds")
    }

    #[tokio::test]
    async fn bind_failure_starts_no_periodic_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let occupied = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = occupied.local_addr().expect("local addr");
        let registry = Arc::new(registry_with_bind(dir.path(), &addr.to_string()).await);

        let result = serve(Arc::clone(&registry), std::future::pending()).await;

        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let metrics = registry.telemetry.metrics();
        assert!(metrics.collector_ticks.get().abs() < f64::EPSILON);
        assert!(metrics.builder_ticks.get().abs() < f64::EPSILON);
        assert!(!dir.path().join("store.json").exists());
    }

    #[tokio::test]
    async fn component_registry_builds_with_empty_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = format!(
            "SOURCE_BASE_URL: http://localhost:9/\nDIGEST_SNAPSHOT_PATH: {}\n",
            dir.path().join("store.json").display()
        );
        let layers = ConfigLayers::from_yaml(&yaml).expect("yaml").without_env();
        let config = Config::from_layers(&layers).expect("config loads");

        let registry = ComponentRegistry::build_with(
            config,
            Telemetry::without_tracing().expect("telemetry"),
            Arc::new(SystemClock),
        )
        .await
        .expect("registry builds");

        assert_eq!(registry.load_outcome(), LoadOutcome::Missing);
        assert_eq!(registry.store().stats().items, 0);
        assert_eq!(registry.builder().settings().top_n, 10);
    }
}
