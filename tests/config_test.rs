/// YAML 設定ファイル層の読み込みテスト（環境変数は読まない）。
use std::time::Duration;

use digest_worker::config::{Config, ConfigError, ConfigLayers};

fn load(yaml: &str) -> Result<Config, ConfigError> {
    let layers = ConfigLayers::from_yaml(yaml)
        .expect("yaml parses")
        .without_env();
    Config::from_layers(&layers)
}

#[test]
fn full_yaml_file_is_applied() {
    let config = load(
        r"
source_base_url: https://forum.example/
digest_sources: [hot, 'node:rust']
digest_excluded_nodes:
  - jobs
  - promotions
digest_top_n: 8
digest_min_items: 3
digest_skip_hours: 48
collector_interval_minutes: 15
builder_interval_minutes: 45
digest_channel: weekly
digest_title: Forum Digest
digest_language: ja
digest_tz_offset_hours: 9
source_connect_timeout_ms: 2000
ai_enabled: true
ai_model: local-model
ai_timeout_secs: 20
",
    )
    .expect("config loads");

    assert_eq!(config.sources(), &["hot", "node:rust"]);
    assert_eq!(config.excluded_nodes(), &["jobs", "promotions"]);
    assert_eq!(config.top_n(), 8);
    assert_eq!(config.min_items(), 3);
    assert_eq!(config.skip_ttl(), Duration::from_secs(48 * 3600));
    assert_eq!(config.collector_interval(), Duration::from_secs(15 * 60));
    assert_eq!(config.builder_interval(), Duration::from_secs(45 * 60));
    assert_eq!(config.channel(), "weekly");
    assert_eq!(config.digest_title(), "Forum Digest");
    assert_eq!(config.language(), "ja");
    assert_eq!(config.tz_offset().local_minus_utc(), 9 * 3600);
    assert_eq!(config.source_connect_timeout(), Duration::from_millis(2000));
    assert!(config.ai_enabled());
    assert_eq!(config.ai_model(), "local-model");
    assert_eq!(config.ai_timeout(), Duration::from_secs(20));
}

#[test]
fn empty_file_still_requires_source_url() {
    let error = load("").expect_err("base URL is required");
    assert!(matches!(error, ConfigError::Missing("SOURCE_BASE_URL")));
}

#[test]
fn non_mapping_file_is_rejected() {
    assert!(ConfigLayers::from_yaml("- just\n- a list\n").is_err());
}

#[test]
fn negative_timezone_offsets_are_accepted() {
    let config = load("SOURCE_BASE_URL: https://forum.example/\nDIGEST_TZ_OFFSET_HOURS: -5\n")
        .expect("config loads");
    assert_eq!(config.tz_offset().local_minus_utc(), -5 * 3600);
}
