//! Dedup / filter / sort helper for the one-shot generate path.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::pipeline::scoring::compute_score;
use crate::store::{Item, ScoredItem};

/// 上位 `top_n` 件を選ぶ。
///
/// 1. 先に現れたものを残して ID で重複排除
/// 2. `skip_ids` に含まれる ID と、除外ノード（大文字小文字を無視）を除外
/// 3. スコアを計算し、0 以下を除外
/// 4. スコア降順の安定ソート（同点は入力順）
/// 5. `top_n` 件に切り詰め
#[must_use]
pub fn rank_top(
    items: &[Item],
    top_n: usize,
    skip_ids: &HashSet<String>,
    exclude_nodes: &[String],
    now: DateTime<Utc>,
) -> Vec<ScoredItem> {
    let excluded: HashSet<String> = exclude_nodes.iter().map(|n| n.to_lowercase()).collect();
    let mut seen = HashSet::new();

    let mut ranked: Vec<ScoredItem> = items
        .iter()
        .filter(|item| seen.insert(item.id.as_str()))
        .filter(|item| !skip_ids.contains(&item.id))
        .filter(|item| !excluded.contains(&item.node_name.to_lowercase()))
        .filter_map(|item| {
            let score = compute_score(item, now);
            (score > 0.0).then(|| ScoredItem {
                item: item.clone(),
                score,
            })
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(top_n);
    ranked
}
