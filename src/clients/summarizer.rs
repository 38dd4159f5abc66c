/// AI 要約クライアント。
///
/// OpenAI 互換の chat completions API を呼び出す。失敗はすべてログに残して空文字列へ
/// 縮退させるため、呼び出し側は空文字列を「要約なし」として扱えばよい。
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::ScoredItem;
use crate::util::text::{collapse_whitespace, truncate_graphemes};

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// 1 件のトピックを要約する。失敗時は空文字列。
    async fn summarize_item(&self, title: &str, body: &str, language: &str) -> String;

    /// ダイジェスト全体の概要を生成する。失敗時は空文字列。
    async fn summarize_overall(&self, items: &[ScoredItem], language: &str) -> String;
}

/// AI を無効にしたときの要約器。常に空文字列を返す。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize_item(&self, _title: &str, _body: &str, _language: &str) -> String {
        String::new()
    }

    async fn summarize_overall(&self, _items: &[ScoredItem], _language: &str) -> String {
        String::new()
    }
}

#[derive(Debug, Clone)]
pub struct LlmSummarizerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub max_input_graphemes: usize,
}

#[derive(Debug, Clone)]
pub struct LlmSummarizer {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    model: String,
    max_input_graphemes: usize,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmSummarizer {
    /// # Errors
    /// ベース URL が不正、または HTTP クライアントの構築に失敗した場合はエラーを返す。
    pub fn new(config: LlmSummarizerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build summarizer HTTP client")?;

        // `Url::join` drops the last segment unless the base ends with '/'.
        let mut raw = config.base_url;
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).context("invalid AI base URL")?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            model: config.model,
            max_input_graphemes: config.max_input_graphemes,
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = self
            .base_url
            .join("chat/completions")
            .context("failed to build chat completions URL")?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.3,
        };

        let mut builder = self.client.post(url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("chat completions request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "chat completions returned error status {status}: {}",
                truncate_graphemes(&body, 200)
            ));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to deserialize chat completions response")?;

        let content = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .unwrap_or_default();

        debug!(chars = content.chars().count(), "chat completion received");
        Ok(content)
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize_item(&self, title: &str, body: &str, language: &str) -> String {
        let system = format!(
            "You summarize forum discussions. Reply in {language} with one or two plain sentences. No preamble."
        );
        let body = truncate_graphemes(&collapse_whitespace(body), self.max_input_graphemes);
        let user = format!("Title: {title}\n\n{body}");

        match self.complete(&system, &user).await {
            Ok(text) => text,
            Err(error) => {
                warn!(%title, error = %format!("{error:#}"), "item summarization failed");
                String::new()
            }
        }
    }

    async fn summarize_overall(&self, items: &[ScoredItem], language: &str) -> String {
        if items.is_empty() {
            return String::new();
        }

        let system = format!(
            "You write the opening paragraph of a daily digest of popular forum topics. \
             Reply in {language} with at most three sentences. No preamble."
        );
        let mut user = String::new();
        for (index, entry) in items.iter().enumerate() {
            let _ = writeln!(
                user,
                "{}. [{}] {} ({} replies)",
                index + 1,
                entry.item.node_name,
                entry.item.title,
                entry.item.replies
            );
        }

        match self.complete(&system, &user).await {
            Ok(text) => text,
            Err(error) => {
                warn!(items = items.len(), error = %format!("{error:#}"), "overall summarization failed");
                String::new()
            }
        }
    }
}
