use axum::{Json, extract::State};
use serde::Serialize;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct DigestStatus {
    channel: String,
    period: String,
    published: bool,
    qualifying: usize,
    required: usize,
    stored_items: usize,
    skip_markers: usize,
    top: Vec<StatusEntry>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusEntry {
    id: String,
    title: String,
    node: String,
    replies: u32,
    score: f64,
}

/// 現在の期間の公開状態と上位候補を返す。
pub(crate) async fn digest_status(State(state): State<AppState>) -> Json<DigestStatus> {
    let builder = state.builder();
    let settings = builder.settings();
    let store = state.store();
    let period = store.current_period();

    let candidates = builder.qualifying_candidates(&period);
    let stats = store.stats();
    let top = candidates
        .iter()
        .take(settings.top_n)
        .map(|candidate| StatusEntry {
            id: candidate.item.id.clone(),
            title: candidate.item.title.clone(),
            node: candidate.item.node_name.clone(),
            replies: candidate.item.replies,
            score: candidate.score,
        })
        .collect();

    Json(DigestStatus {
        channel: settings.channel.clone(),
        published: store.is_published(&settings.channel, &period),
        period: period.to_string(),
        qualifying: candidates.len(),
        required: settings.min_items,
        stored_items: stats.items,
        skip_markers: stats.skip_markers,
        top,
    })
}
