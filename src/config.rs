use std::{
    collections::HashMap,
    env,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::FixedOffset;
use thiserror::Error;

use crate::clients::SourceSpec;
use crate::store::models::KEY_SEPARATOR;
use crate::util::retry::RetryConfig;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// 設定ファイルのパスを指す環境変数。
pub const CONFIG_PATH_ENV: &str = "DIGEST_CONFIG_PATH";

const SECONDS_PER_HOUR: i32 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    source_base_url: String,
    sources: Vec<String>,
    excluded_nodes: Vec<String>,
    top_n: usize,
    min_items: usize,
    skip_hours: u64,
    collector_interval: Duration,
    builder_interval: Duration,
    channel: String,
    digest_title: String,
    language: String,
    snapshot_path: PathBuf,
    cache_dir: PathBuf,
    output_dir: PathBuf,
    tz_offset: FixedOffset,
    source_connect_timeout: Duration,
    source_total_timeout: Duration,
    http_max_retries: usize,
    http_backoff_base_ms: u64,
    http_backoff_cap_ms: u64,
    ai_enabled: bool,
    ai_base_url: String,
    ai_api_key: Option<String>,
    ai_model: String,
    ai_timeout: Duration,
    ai_max_concurrency: NonZeroUsize,
    ai_max_input_graphemes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to load config file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// 設定値の取得元。環境変数が設定ファイルの値より優先される。
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    file: HashMap<String, String>,
    read_env: bool,
}

impl ConfigLayers {
    /// 環境変数のみ。
    #[must_use]
    pub fn env() -> Self {
        Self {
            file: HashMap::new(),
            read_env: true,
        }
    }

    /// YAML のマッピングを設定ファイル層として読み込む。
    ///
    /// キーは環境変数名（大文字小文字は問わない）。シーケンスはカンマ区切りに変換する。
    ///
    /// # Errors
    /// YAML として不正、またはトップレベルがマッピングでない場合はエラーを返す。
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let mut file = HashMap::new();
        match value {
            serde_yaml::Value::Null => {}
            serde_yaml::Value::Mapping(mapping) => {
                for (key, value) in mapping {
                    let key = yaml_scalar(&key)
                        .ok_or_else(|| anyhow::anyhow!("config keys must be scalars"))?;
                    let value = match value {
                        serde_yaml::Value::Sequence(items) => items
                            .iter()
                            .filter_map(yaml_scalar)
                            .collect::<Vec<_>>()
                            .join(","),
                        serde_yaml::Value::Null => continue,
                        other => yaml_scalar(&other)
                            .ok_or_else(|| anyhow::anyhow!("unsupported value for {key}"))?,
                    };
                    file.insert(key.to_uppercase(), value);
                }
            }
            _ => anyhow::bail!("config file must contain a mapping"),
        }
        Ok(Self {
            file,
            read_env: true,
        })
    }

    /// 環境変数を読まない（テストや埋め込み用途）。
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    fn get(&self, name: &str) -> Option<String> {
        if self.read_env {
            if let Ok(value) = env::var(name) {
                return Some(value);
            }
        }
        self.file.get(name).cloned()
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Config {
    /// 環境変数からダイジェストワーカーの設定値を読み込み、検証する。
    ///
    /// # Errors
    /// `SOURCE_BASE_URL` が未設定、もしくは各種値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_layers(&ConfigLayers::env())
    }

    /// 設定ファイル（任意）と環境変数から読み込む。
    ///
    /// `path` が `None` の場合は `DIGEST_CONFIG_PATH` を参照し、それも無ければ環境変数のみ。
    ///
    /// # Errors
    /// ファイルの読み込みやパース、各値の検証に失敗した場合は [`ConfigError`] を返す。
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let layers = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|error| ConfigError::File {
                    path: path.clone(),
                    source: anyhow::Error::new(error),
                })?;
                ConfigLayers::from_yaml(&raw)
                    .map_err(|source| ConfigError::File { path, source })?
            }
            None => ConfigLayers::env(),
        };
        Self::from_layers(&layers)
    }

    /// # Errors
    /// 必須値が無い、または値の検証に失敗した場合は [`ConfigError`] を返す。
    pub fn from_layers(layers: &ConfigLayers) -> Result<Self, ConfigError> {
        let p = Parser { layers };

        let source_base_url = p.required("SOURCE_BASE_URL")?;
        let http_bind = p.socket_addr("DIGEST_WORKER_HTTP_BIND", "0.0.0.0:9010")?;

        let sources = p.csv("DIGEST_SOURCES", "hot,latest");
        if sources.is_empty() {
            return Err(invalid("DIGEST_SOURCES", "at least one source is required"));
        }
        for source in &sources {
            source
                .parse::<SourceSpec>()
                .map_err(|source| ConfigError::Invalid {
                    name: "DIGEST_SOURCES",
                    source,
                })?;
        }
        let excluded_nodes = p.csv("DIGEST_EXCLUDED_NODES", "");

        let top_n = p.positive_usize("DIGEST_TOP_N", 10)?;
        let min_items = p.positive_usize("DIGEST_MIN_ITEMS", 5)?;
        let skip_hours = p.u64("DIGEST_SKIP_HOURS", 72)?;
        let collector_interval = p.positive_minutes("COLLECTOR_INTERVAL_MINUTES", 30)?;
        let builder_interval = p.positive_minutes("BUILDER_INTERVAL_MINUTES", 60)?;

        let channel = p.string("DIGEST_CHANNEL", "daily");
        if channel.trim().is_empty() || channel.contains(KEY_SEPARATOR) {
            return Err(invalid(
                "DIGEST_CHANNEL",
                "must be non-empty and must not contain '|'",
            ));
        }
        let digest_title = p.string("DIGEST_TITLE", "Daily Hot Topics");
        let language = p.string("DIGEST_LANGUAGE", "en");

        let snapshot_path = PathBuf::from(p.string("DIGEST_SNAPSHOT_PATH", "data/store.json"));
        let cache_dir = PathBuf::from(p.string("DIGEST_CACHE_DIR", "data/cache"));
        let output_dir = PathBuf::from(p.string("DIGEST_OUTPUT_DIR", "data/digests"));

        let tz_hours = p.i32("DIGEST_TZ_OFFSET_HOURS", 0)?;
        let tz_offset = tz_hours
            .checked_mul(SECONDS_PER_HOUR)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| invalid("DIGEST_TZ_OFFSET_HOURS", "offset must be within ±23 hours"))?;

        // HTTP timeout settings
        let source_connect_timeout = p.duration_ms("SOURCE_CONNECT_TIMEOUT_MS", 5000)?;
        let source_total_timeout = p.duration_ms("SOURCE_TOTAL_TIMEOUT_MS", 30000)?;

        // Retry settings (exponential backoff + jitter)
        let http_max_retries = p.positive_usize("HTTP_MAX_RETRIES", 3)?;
        let http_backoff_base_ms = p.u64("HTTP_BACKOFF_BASE_MS", 250)?;
        let http_backoff_cap_ms = p.u64("HTTP_BACKOFF_CAP_MS", 10000)?;

        // AI summarization settings
        let ai_enabled = p.bool("AI_ENABLED", false)?;
        let ai_base_url = p.string("AI_BASE_URL", "https://api.openai.com/v1");
        let ai_api_key = p.optional("AI_API_KEY");
        let ai_model = p.string("AI_MODEL", "gpt-4o-mini");
        let ai_timeout = p.duration_secs("AI_TIMEOUT_SECS", 60)?;
        let ai_max_concurrency = NonZeroUsize::new(p.positive_usize("AI_MAX_CONCURRENCY", 2)?)
            .ok_or_else(|| invalid("AI_MAX_CONCURRENCY", "must be greater than zero"))?;
        let ai_max_input_graphemes = p.positive_usize("AI_MAX_INPUT_GRAPHEMES", 2000)?;

        Ok(Self {
            http_bind,
            source_base_url,
            sources,
            excluded_nodes,
            top_n,
            min_items,
            skip_hours,
            collector_interval,
            builder_interval,
            channel,
            digest_title,
            language,
            snapshot_path,
            cache_dir,
            output_dir,
            tz_offset,
            source_connect_timeout,
            source_total_timeout,
            http_max_retries,
            http_backoff_base_ms,
            http_backoff_cap_ms,
            ai_enabled,
            ai_base_url,
            ai_api_key,
            ai_model,
            ai_timeout,
            ai_max_concurrency,
            ai_max_input_graphemes,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn source_base_url(&self) -> &str {
        &self.source_base_url
    }

    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    #[must_use]
    pub fn excluded_nodes(&self) -> &[String] {
        &self.excluded_nodes
    }

    #[must_use]
    pub fn top_n(&self) -> usize {
        self.top_n
    }

    #[must_use]
    pub fn min_items(&self) -> usize {
        self.min_items
    }

    #[must_use]
    pub fn skip_hours(&self) -> u64 {
        self.skip_hours
    }

    #[must_use]
    pub fn skip_ttl(&self) -> Duration {
        Duration::from_secs(self.skip_hours.saturating_mul(3600))
    }

    #[must_use]
    pub fn collector_interval(&self) -> Duration {
        self.collector_interval
    }

    #[must_use]
    pub fn builder_interval(&self) -> Duration {
        self.builder_interval
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn digest_title(&self) -> &str {
        &self.digest_title
    }

    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    #[must_use]
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    #[must_use]
    pub fn tz_offset(&self) -> FixedOffset {
        self.tz_offset
    }

    #[must_use]
    pub fn source_connect_timeout(&self) -> Duration {
        self.source_connect_timeout
    }

    #[must_use]
    pub fn source_total_timeout(&self) -> Duration {
        self.source_total_timeout
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.http_max_retries,
            self.http_backoff_base_ms,
            self.http_backoff_cap_ms,
        )
    }

    #[must_use]
    pub fn ai_enabled(&self) -> bool {
        self.ai_enabled
    }

    #[must_use]
    pub fn ai_base_url(&self) -> &str {
        &self.ai_base_url
    }

    #[must_use]
    pub fn ai_api_key(&self) -> Option<&str> {
        self.ai_api_key.as_deref()
    }

    #[must_use]
    pub fn ai_model(&self) -> &str {
        &self.ai_model
    }

    #[must_use]
    pub fn ai_timeout(&self) -> Duration {
        self.ai_timeout
    }

    #[must_use]
    pub fn ai_max_concurrency(&self) -> NonZeroUsize {
        self.ai_max_concurrency
    }

    #[must_use]
    pub fn ai_max_input_graphemes(&self) -> usize {
        self.ai_max_input_graphemes
    }
}

fn invalid(name: &'static str, message: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        source: anyhow::anyhow!(message),
    }
}

struct Parser<'a> {
    layers: &'a ConfigLayers,
}

impl Parser<'_> {
    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn optional(&self, name: &'static str) -> Option<String> {
        self.layers
            .get(name)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }

    fn string(&self, name: &'static str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(name) {
            Some(raw) => raw.parse::<T>().map_err(|error| ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            }),
            None => Ok(default),
        }
    }

    fn socket_addr(&self, name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
        let raw = self.string(name, default);
        raw.parse().map_err(|error| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(error),
        })
    }

    fn u64(&self, name: &'static str, default: u64) -> Result<u64, ConfigError> {
        self.parse(name, default)
    }

    fn i32(&self, name: &'static str, default: i32) -> Result<i32, ConfigError> {
        self.parse(name, default)
    }

    fn positive_usize(&self, name: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value: usize = self.parse(name, default)?;
        if value == 0 {
            return Err(invalid(name, "must be greater than zero"));
        }
        Ok(value)
    }

    fn positive_minutes(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let minutes = self.u64(name, default)?;
        if minutes == 0 {
            return Err(invalid(name, "must be greater than zero"));
        }
        Ok(Duration::from_secs(minutes.saturating_mul(60)))
    }

    fn duration_secs(&self, name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.u64(name, default_secs)?))
    }

    fn duration_ms(&self, name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.u64(name, default_ms)?))
    }

    fn bool(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.optional(name) else {
            return Ok(default);
        };
        match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("invalid boolean value: {raw}"),
            }),
        }
    }

    fn csv(&self, name: &'static str, default: &str) -> Vec<String> {
        let raw = self
            .layers
            .get(name)
            .unwrap_or_else(|| default.to_string());
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "SOURCE_BASE_URL",
        "DIGEST_WORKER_HTTP_BIND",
        "DIGEST_SOURCES",
        "DIGEST_EXCLUDED_NODES",
        "DIGEST_TOP_N",
        "DIGEST_MIN_ITEMS",
        "DIGEST_SKIP_HOURS",
        "COLLECTOR_INTERVAL_MINUTES",
        "BUILDER_INTERVAL_MINUTES",
        "DIGEST_CHANNEL",
        "DIGEST_TITLE",
        "DIGEST_LANGUAGE",
        "DIGEST_SNAPSHOT_PATH",
        "DIGEST_TZ_OFFSET_HOURS",
        "SOURCE_CONNECT_TIMEOUT_MS",
        "SOURCE_TOTAL_TIMEOUT_MS",
        "HTTP_MAX_RETRIES",
        "AI_ENABLED",
        "AI_API_KEY",
        "AI_TIMEOUT_SECS",
        "DIGEST_CONFIG_PATH",
    ];

    fn set_env(name: &str, value: &str) {
        // SAFETY: tests run sequentially and assign valid UTF-8 values.
        unsafe {
            env::set_var(name, value);
        }
    }

    fn reset_env() {
        for key in KEYS {
            // SAFETY: tests run sequentially and clean up deterministic keys.
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn from_env_uses_defaults_when_optional_missing() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("SOURCE_BASE_URL", "https://forum.example/");

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.source_base_url(), "https://forum.example/");
        assert_eq!(config.http_bind(), "0.0.0.0:9010".parse().expect("addr"));
        assert_eq!(config.sources(), &["hot", "latest"]);
        assert!(config.excluded_nodes().is_empty());
        assert_eq!(config.top_n(), 10);
        assert_eq!(config.min_items(), 5);
        assert_eq!(config.skip_ttl(), Duration::from_secs(72 * 3600));
        assert_eq!(config.collector_interval(), Duration::from_secs(30 * 60));
        assert_eq!(config.builder_interval(), Duration::from_secs(60 * 60));
        assert_eq!(config.channel(), "daily");
        assert_eq!(config.tz_offset().local_minus_utc(), 0);
        assert_eq!(config.source_connect_timeout(), Duration::from_millis(5000));
        assert_eq!(config.source_total_timeout(), Duration::from_millis(30000));
        assert_eq!(config.retry_config().max_attempts, 3);
        assert!(!config.ai_enabled());
        assert_eq!(config.ai_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn from_env_overrides_values() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("SOURCE_BASE_URL", "https://forum.example/");
        set_env("DIGEST_SOURCES", "hot, node:rust");
        set_env("DIGEST_EXCLUDED_NODES", "jobs,promotions");
        set_env("DIGEST_TOP_N", "7");
        set_env("DIGEST_TZ_OFFSET_HOURS", "9");
        set_env("AI_ENABLED", "yes");
        set_env("AI_API_KEY", "sk-env");

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.sources(), &["hot", "node:rust"]);
        assert_eq!(config.excluded_nodes(), &["jobs", "promotions"]);
        assert_eq!(config.top_n(), 7);
        assert_eq!(config.tz_offset().local_minus_utc(), 9 * 3600);
        assert!(config.ai_enabled());
        assert_eq!(config.ai_api_key(), Some("sk-env"));
    }

    #[test]
    fn from_env_errors_when_required_missing() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();

        let error = Config::from_env().expect_err("missing base URL should fail");

        assert!(matches!(error, ConfigError::Missing("SOURCE_BASE_URL")));
    }

    #[test]
    fn rejects_invalid_values() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        for (key, value) in [
            ("DIGEST_TOP_N", "0"),
            ("DIGEST_SOURCES", "hot,trending"),
            ("DIGEST_CHANNEL", "a|b"),
            ("DIGEST_TZ_OFFSET_HOURS", "30"),
            ("COLLECTOR_INTERVAL_MINUTES", "0"),
            ("AI_ENABLED", "maybe"),
        ] {
            reset_env();
            set_env("SOURCE_BASE_URL", "https://forum.example/");
            set_env(key, value);

            let error = Config::from_env().expect_err("invalid value should fail");
            assert!(
                matches!(error, ConfigError::Invalid { name, .. } if name == key),
                "{key}={value} produced {error:?}"
            );
        }
    }

    #[test]
    fn env_overrides_file_values() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("DIGEST_TOP_N", "4");

        let layers = ConfigLayers::from_yaml(
            "source_base_url: https://file.example/\ndigest_top_n: 12\ndigest_sources:\n  - hot\n  - node:go\n",
        )
        .expect("yaml parses");
        let config = Config::from_layers(&layers).expect("config should load");

        assert_eq!(config.source_base_url(), "https://file.example/");
        assert_eq!(config.top_n(), 4);
        assert_eq!(config.sources(), &["hot", "node:go"]);
    }

    #[test]
    fn load_reads_file_named_by_env() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("digest.yaml");
        std::fs::write(&path, "SOURCE_BASE_URL: https://file.example/\nAI_ENABLED: true\n")
            .expect("write config");
        set_env(CONFIG_PATH_ENV, path.to_str().expect("utf8 path"));

        let config = Config::load(None).expect("config should load");
        reset_env();

        assert_eq!(config.source_base_url(), "https://file.example/");
        assert!(config.ai_enabled());
    }

    #[test]
    fn load_reports_missing_file() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();

        let error = Config::load(Some(Path::new("/nonexistent/digest.yaml")))
            .expect_err("missing file should fail");

        assert!(matches!(error, ConfigError::File { .. }));
    }
}
