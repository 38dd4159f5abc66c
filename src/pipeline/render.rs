/// ダイジェストの Markdown レンダリング。
use std::fmt::Write as _;

use crate::store::ScoredItem;

/// レンダリング対象の 1 件。`description` が空なら要約なしとして扱う。
#[derive(Debug, Clone, PartialEq)]
pub struct DigestEntry {
    pub ranked: ScoredItem,
    pub description: String,
}

/// タイトル・日付・全体要約・ランキング済みアイテムから Markdown 文書を組み立てる。
#[must_use]
pub fn render(title: &str, date: &str, overall_summary: &str, entries: &[DigestEntry]) -> String {
    let mut doc = String::new();
    let _ = writeln!(doc, "# {title} · {date}");
    doc.push('\n');

    let overall = overall_summary.trim();
    if !overall.is_empty() {
        for line in overall.lines() {
            let _ = writeln!(doc, "> {line}");
        }
        doc.push('\n');
    }

    for (index, entry) in entries.iter().enumerate() {
        let item = &entry.ranked.item;
        let heading = escape_brackets(&item.title);
        match item.url.as_deref() {
            Some(url) => {
                let _ = writeln!(doc, "## {}. [{heading}]({url})", index + 1);
            }
            None => {
                let _ = writeln!(doc, "## {}. {heading}", index + 1);
            }
        }
        doc.push('\n');

        let node = if item.node_title.is_empty() {
            item.node_name.as_str()
        } else {
            item.node_title.as_str()
        };
        let _ = writeln!(
            doc,
            "- {node} · @{author} · {replies} replies · score {score:.3}",
            author = item.author,
            replies = item.replies,
            score = entry.ranked.score,
        );

        let description = entry.description.trim();
        if !description.is_empty() {
            doc.push('\n');
            let _ = writeln!(doc, "{description}");
        }
        doc.push('\n');
    }

    doc
}

fn escape_brackets(text: &str) -> String {
    text.replace('[', "\\[").replace(']', "\\]")
}
