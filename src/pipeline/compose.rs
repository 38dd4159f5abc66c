//! Summarize-then-render step shared by the builder and the one-shot path.

use futures::stream::{self, StreamExt};

use crate::clients::Summarizer;
use crate::pipeline::render::{DigestEntry, render};
use crate::store::ScoredItem;

#[derive(Debug, Clone, PartialEq)]
pub struct ComposedDigest {
    pub document: String,
    /// 空で返ってきた要約の数（全体要約を含む）。
    pub empty_summaries: usize,
}

/// 各アイテムと全体の要約を取得して Markdown を組み立てる。
///
/// アイテム要約は `concurrency` 件まで並行に取得し、出力順は入力順を保つ。
pub async fn compose_digest(
    summarizer: &dyn Summarizer,
    title: &str,
    date: &str,
    language: &str,
    ranked: &[ScoredItem],
    concurrency: usize,
) -> ComposedDigest {
    let pending: Vec<_> = ranked
        .iter()
        .map(|entry| summarizer.summarize_item(&entry.item.title, &entry.item.content, language))
        .collect();
    let descriptions: Vec<String> = stream::iter(pending)
        .buffered(concurrency.max(1))
        .collect()
        .await;
    let overall = summarizer.summarize_overall(ranked, language).await;

    let mut empty_summaries = descriptions.iter().filter(|d| d.trim().is_empty()).count();
    if overall.trim().is_empty() {
        empty_summaries += 1;
    }

    let entries: Vec<DigestEntry> = ranked
        .iter()
        .cloned()
        .zip(descriptions)
        .map(|(ranked, description)| DigestEntry {
            ranked,
            description,
        })
        .collect();

    ComposedDigest {
        document: render(title, date, &overall, &entries),
        empty_summaries,
    }
}
