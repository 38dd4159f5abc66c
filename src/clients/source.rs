/// フォーラム API からトピックを取得するクライアント。
///
/// タイムアウトと指数バックオフ付き再試行をサポートします。
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::store::Item;
use crate::util::retry::{RetryConfig, is_retryable_error};

/// 取得元の識別子。`hot` / `latest` / `node:<name>`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Hot,
    Latest,
    Node(String),
}

impl FromStr for SourceSpec {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "hot" => Ok(Self::Hot),
            "latest" => Ok(Self::Latest),
            other => match other.strip_prefix("node:") {
                Some(name) if !name.trim().is_empty() => Ok(Self::Node(name.trim().to_string())),
                _ => Err(anyhow!(
                    "unknown source '{other}' (expected hot, latest or node:<name>)"
                )),
            },
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hot => f.write_str("hot"),
            Self::Latest => f.write_str("latest"),
            Self::Node(name) => write!(f, "node:{name}"),
        }
    }
}

/// コレクタやワンショット生成から見たソース取得の境界。
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<Vec<Item>>;
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct SourceClient {
    client: Client,
    base_url: Url,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TopicPayload {
    id: RawId,
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    replies: i64,
    created: i64,
    node: NodePayload,
    #[serde(default)]
    member: Option<MemberPayload>,
}

#[derive(Debug, Deserialize)]
struct NodePayload {
    name: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct MemberPayload {
    #[serde(default)]
    username: String,
}

impl TopicPayload {
    fn into_item(self) -> Option<Item> {
        let created = DateTime::<Utc>::from_timestamp(self.created, 0)?;
        Some(Item {
            id: self.id.into_string(),
            title: self.title,
            content: self.content,
            node_name: self.node.name,
            node_title: self.node.title,
            author: self.member.map(|m| m.username).unwrap_or_default(),
            replies: u32::try_from(self.replies.max(0)).unwrap_or(u32::MAX),
            created,
            url: self.url,
        })
    }
}

impl SourceClient {
    /// # Errors
    /// URL のパースまたは HTTP クライアントの構築に失敗した場合はエラーを返す。
    pub fn new(config: SourceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build source HTTP client")?;

        let mut raw = config.base_url;
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).context("invalid source base URL")?;

        Ok(Self {
            client,
            base_url,
            retry: config.retry,
        })
    }

    fn endpoint(&self, spec: &SourceSpec) -> Result<Url> {
        let mut url = match spec {
            SourceSpec::Hot => self.base_url.join("api/topics/hot.json"),
            SourceSpec::Latest => self.base_url.join("api/topics/latest.json"),
            SourceSpec::Node(_) => self.base_url.join("api/topics/show.json"),
        }
        .context("failed to build source URL")?;

        if let SourceSpec::Node(name) = spec {
            url.query_pairs_mut().append_pair("node_name", name);
        }
        Ok(url)
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<TopicPayload>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context("source request failed")?
            .error_for_status()
            .context("source returned error status")?;

        response
            .json::<Vec<TopicPayload>>()
            .await
            .context("failed to deserialize source response")
    }

    /// 再試行付きで取得する。
    async fn fetch_with_retry(&self, url: &Url) -> Result<Vec<TopicPayload>> {
        let mut attempt = 0;

        loop {
            match self.fetch_once(url).await {
                Ok(topics) => {
                    if attempt > 0 {
                        info!(attempt, %url, "source fetch succeeded after retry");
                    }
                    return Ok(topics);
                }
                Err(err) => {
                    attempt += 1;

                    if !self.retry.can_retry(attempt) {
                        warn!(
                            attempt,
                            max_attempts = self.retry.max_attempts,
                            %url,
                            "source fetch failed after all retries"
                        );
                        return Err(err);
                    }

                    let retryable = err
                        .chain()
                        .find_map(|cause| cause.downcast_ref::<reqwest::Error>())
                        .is_some_and(is_retryable_error);
                    if !retryable {
                        return Err(err);
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %url,
                        "source fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for SourceClient {
    async fn fetch(&self, source: &str) -> Result<Vec<Item>> {
        let spec: SourceSpec = source.parse()?;
        let url = self.endpoint(&spec)?;
        let topics = self
            .fetch_with_retry(&url)
            .await
            .with_context(|| format!("failed to fetch source {spec}"))?;

        let total = topics.len();
        let items: Vec<Item> = topics.into_iter().filter_map(TopicPayload::into_item).collect();
        if items.len() < total {
            warn!(
                source = %spec,
                dropped = total - items.len(),
                "dropped topics with invalid timestamps"
            );
        }
        debug!(source = %spec, count = items.len(), "fetched topics");
        Ok(items)
    }
}
