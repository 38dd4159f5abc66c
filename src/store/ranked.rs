//! In-memory ranked store shared by the collector and the builder.
//!
//! All four sub-structures (items, per-period score tables, publish markers,
//! skip markers) live behind a single mutex. No method awaits while holding
//! it, so a reader never observes a half-applied upsert.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::models::{Item, Period, ScoredItem, composite_key, split_composite_key};
use super::snapshot::{
    SNAPSHOT_VERSION, Snapshot, SnapshotError, backup_path, read_snapshot, write_snapshot,
};
use crate::util::time::Clock;

/// スコアテーブルを保持する日数。これより古い期間は `gc()` で削除される。
pub const SCORE_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Default)]
struct StoreState {
    items: HashMap<String, Item>,
    scores: BTreeMap<Period, HashMap<String, f64>>,
    published: HashSet<(String, Period)>,
    skipped: HashMap<(String, String), DateTime<Utc>>,
}

/// `gc()` の結果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub expired_skips: usize,
    pub dropped_periods: usize,
    pub dropped_items: usize,
}

/// `load()` の結果。どの場合もストアは利用可能な状態になる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// スナップショットが存在しない。
    Missing,
    /// 正常なスナップショットを読み込んだ。
    Restored,
    /// 本体が壊れていたためバックアップから復元した。
    RestoredFromBackup,
    /// 本体もバックアップも使えず、空の状態で起動した。
    StartedEmpty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub items: usize,
    pub periods: usize,
    pub published: usize,
    pub skip_markers: usize,
}

#[derive(Debug)]
pub struct RankedStore {
    state: Mutex<StoreState>,
    snapshot_path: Option<PathBuf>,
    // Serializes snapshot writes; held across awaits, never together with `state`.
    persist_lock: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl RankedStore {
    #[must_use]
    pub fn new(snapshot_path: impl Into<PathBuf>, clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self::build(Some(snapshot_path.into()), clock, offset)
    }

    /// 永続化先を持たないストア。`persist()` / `load()` は何もしない。
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self::build(None, clock, offset)
    }

    fn build(snapshot_path: Option<PathBuf>, clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot_path,
            persist_lock: tokio::sync::Mutex::new(()),
            clock,
            offset,
        }
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[must_use]
    pub fn period_for(&self, instant: DateTime<Utc>) -> Period {
        Period::from_instant(instant, self.offset)
    }

    #[must_use]
    pub fn current_period(&self) -> Period {
        self.period_for(self.now())
    }

    #[must_use]
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// アイテムを差し替え、スコアはラチェット方式で更新する。
    ///
    /// 返り値は期間のスコアが新規登録または引き上げられたかどうか。
    /// 有限でないスコアはスコアテーブルに反映しない。
    pub fn upsert(&self, period: &Period, item: Item, score: f64) -> bool {
        let mut state = self.state.lock();
        let id = item.id.clone();
        state.items.insert(id.clone(), item);

        if !score.is_finite() {
            return false;
        }

        let table = state.scores.entry(period.clone()).or_default();
        match table.get_mut(&id) {
            Some(existing) if *existing >= score => false,
            Some(existing) => {
                *existing = score;
                true
            }
            None => {
                table.insert(id, score);
                true
            }
        }
    }

    /// 期間の上位 `n` 件をスコア降順で返す。同点は id 昇順。
    #[must_use]
    pub fn top_n(&self, period: &Period, n: usize) -> Vec<ScoredItem> {
        let state = self.state.lock();
        let Some(table) = state.scores.get(period) else {
            return Vec::new();
        };

        let mut ranked: Vec<(&String, f64)> = table.iter().map(|(id, s)| (id, *s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        ranked
            .into_iter()
            .filter_map(|(id, score)| {
                state.items.get(id).map(|item| ScoredItem {
                    item: item.clone(),
                    score,
                })
            })
            .take(n)
            .collect()
    }

    #[must_use]
    pub fn score_of(&self, period: &Period, id: &str) -> Option<f64> {
        let state = self.state.lock();
        state.scores.get(period).and_then(|table| table.get(id).copied())
    }

    #[must_use]
    pub fn item(&self, id: &str) -> Option<Item> {
        self.state.lock().items.get(id).cloned()
    }

    #[must_use]
    pub fn is_published(&self, channel: &str, period: &Period) -> bool {
        self.state
            .lock()
            .published
            .contains(&(channel.to_string(), period.clone()))
    }

    /// 公開マーカーを追加する。既に存在した場合は `false`。
    pub fn mark_published(&self, channel: &str, period: &Period) -> bool {
        self.state
            .lock()
            .published
            .insert((channel.to_string(), period.clone()))
    }

    /// スキップ中かどうか。期限切れのエントリはその場で削除して `false` を返す。
    pub fn is_skipped(&self, channel: &str, id: &str) -> bool {
        let now = self.now();
        let mut state = self.state.lock();
        let key = (channel.to_string(), id.to_string());
        match state.skipped.get(&key) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                state.skipped.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn mark_skipped(&self, channel: &str, id: &str, ttl: Duration) {
        let expiry = expiry_after(self.now(), ttl);
        self.state
            .lock()
            .skipped
            .insert((channel.to_string(), id.to_string()), expiry);
    }

    /// 公開マーカーと選択アイテムのスキップマーカーを一つのクリティカルセクションで記録する。
    ///
    /// 既に公開済みの場合は何も変更せず `false` を返す。
    pub fn commit_digest(&self, channel: &str, period: &Period, ids: &[String], ttl: Duration) -> bool {
        let expiry = expiry_after(self.now(), ttl);
        let mut state = self.state.lock();
        if !state.published.insert((channel.to_string(), period.clone())) {
            return false;
        }
        for id in ids {
            state
                .skipped
                .insert((channel.to_string(), id.clone()), expiry);
        }
        true
    }

    /// 期限切れのスキップマーカーと保持期間を過ぎたスコアテーブルを削除する。
    ///
    /// どのスコアテーブルからも参照されなくなったアイテムも併せて削除する。
    pub fn gc(&self) -> GcReport {
        let now = self.now();
        let cutoff = self.period_for(now - TimeDelta::days(SCORE_RETENTION_DAYS));
        let mut state = self.state.lock();

        let skips_before = state.skipped.len();
        state.skipped.retain(|_, expiry| *expiry > now);
        let expired_skips = skips_before - state.skipped.len();

        let periods_before = state.scores.len();
        state.scores.retain(|period, _| *period >= cutoff);
        let dropped_periods = periods_before - state.scores.len();

        let referenced: HashSet<String> = state
            .scores
            .values()
            .flat_map(|table| table.keys().cloned())
            .collect();
        let items_before = state.items.len();
        state.items.retain(|id, _| referenced.contains(id));
        let dropped_items = items_before - state.items.len();

        let report = GcReport {
            expired_skips,
            dropped_periods,
            dropped_items,
        };
        debug!(
            cutoff = %cutoff,
            expired_skips,
            dropped_periods,
            dropped_items,
            "store gc finished"
        );
        report
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            items: state.items.len(),
            periods: state.scores.len(),
            published: state.published.len(),
            skip_markers: state.skipped.len(),
        }
    }

    /// 現在の状態から完全なスナップショットを組み立てる。
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let saved_at = self.now();
        let state = self.state.lock();

        let mut published: Vec<String> = state
            .published
            .iter()
            .map(|(channel, period)| composite_key(channel, period.as_str()))
            .collect();
        published.sort();

        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at,
            items: state
                .items
                .iter()
                .map(|(id, item)| (id.clone(), item.clone()))
                .collect(),
            scores: state
                .scores
                .iter()
                .map(|(period, table)| {
                    (
                        period.as_str().to_string(),
                        table.iter().map(|(id, s)| (id.clone(), *s)).collect(),
                    )
                })
                .collect(),
            published,
            skipped: state
                .skipped
                .iter()
                .map(|((channel, id), expiry)| (composite_key(channel, id), *expiry))
                .collect(),
        }
    }

    /// スナップショットで状態を丸ごと置き換える。不正なキーは警告して読み飛ばす。
    pub fn restore(&self, snapshot: Snapshot) {
        let mut next = StoreState {
            items: snapshot.items.into_iter().collect(),
            ..StoreState::default()
        };

        for (raw_period, table) in snapshot.scores {
            let Ok(period) = Period::parse(&raw_period) else {
                warn!(period = %raw_period, "ignoring score table with invalid period key");
                continue;
            };
            let table: HashMap<String, f64> =
                table.into_iter().filter(|(_, s)| s.is_finite()).collect();
            next.scores.insert(period, table);
        }

        for key in snapshot.published {
            match split_composite_key(&key).and_then(|(c, p)| Period::parse(p).ok().map(|p| (c, p))) {
                Some((channel, period)) => {
                    next.published.insert((channel.to_string(), period));
                }
                None => warn!(%key, "ignoring malformed publish marker"),
            }
        }

        for (key, expiry) in snapshot.skipped {
            match split_composite_key(&key) {
                Some((channel, id)) => {
                    next.skipped
                        .insert((channel.to_string(), id.to_string()), expiry);
                }
                None => warn!(%key, "ignoring malformed skip marker"),
            }
        }

        *self.state.lock() = next;
    }

    /// 状態をスナップショットファイルへ書き出す。永続化先がなければ何もしない。
    ///
    /// # Errors
    /// エンコードまたはファイル書き込みに失敗した場合は [`SnapshotError`] を返す。
    pub async fn persist(&self) -> Result<(), SnapshotError> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        write_snapshot(path, &snapshot).await?;
        debug!(
            path = %path.display(),
            items = snapshot.items.len(),
            periods = snapshot.scores.len(),
            "store snapshot persisted"
        );
        Ok(())
    }

    /// スナップショットを読み込む。欠損・破損でも失敗せず、必ず利用可能な状態で返る。
    pub async fn load(&self) -> LoadOutcome {
        let Some(path) = self.snapshot_path.clone() else {
            return LoadOutcome::Missing;
        };

        let primary_error = match read_snapshot(&path).await {
            Ok(Some(snapshot)) => {
                self.restore(snapshot);
                info!(path = %path.display(), stats = ?self.stats(), "store snapshot restored");
                return LoadOutcome::Restored;
            }
            Ok(None) => None,
            Err(error) => {
                warn!(path = %path.display(), %error, "store snapshot unreadable, trying backup");
                Some(error)
            }
        };

        let backup = backup_path(&path);
        match read_snapshot(&backup).await {
            Ok(Some(snapshot)) => {
                self.restore(snapshot);
                warn!(
                    path = %backup.display(),
                    stats = ?self.stats(),
                    "store restored from backup snapshot"
                );
                LoadOutcome::RestoredFromBackup
            }
            Ok(None) if primary_error.is_none() => {
                info!(path = %path.display(), "no store snapshot found, starting empty");
                LoadOutcome::Missing
            }
            Ok(None) => {
                warn!(
                    path = %path.display(),
                    "no usable snapshot, starting empty; publish and skip history is lost"
                );
                LoadOutcome::StartedEmpty
            }
            Err(error) => {
                warn!(
                    path = %backup.display(),
                    %error,
                    "backup snapshot unreadable, starting empty; publish and skip history is lost"
                );
                LoadOutcome::StartedEmpty
            }
        }
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::time::ManualClock;
    use tempfile::tempdir;

    fn parse_utc(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).expect("utc offset")
    }

    fn item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            title: format!("title {id}"),
            content: String::new(),
            node_name: "tech".to_string(),
            node_title: "Tech".to_string(),
            author: "alice".to_string(),
            replies: 10,
            created: parse_utc("2025-11-08T00:00:00Z"),
            url: None,
        }
    }

    fn store_at(ts: &str) -> (Arc<ManualClock>, RankedStore) {
        let clock = Arc::new(ManualClock::new(parse_utc(ts)));
        let store = RankedStore::in_memory(clock.clone(), utc());
        (clock, store)
    }

    #[test]
    fn upsert_never_lowers_score() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = store.current_period();

        assert!(store.upsert(&period, item("a"), 5.0));
        assert!(!store.upsert(&period, item("a"), 3.0));
        assert_eq!(store.score_of(&period, "a"), Some(5.0));
    }

    #[test]
    fn upsert_raises_score() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = store.current_period();

        store.upsert(&period, item("a"), 3.0);
        assert!(store.upsert(&period, item("a"), 5.0));
        assert_eq!(store.score_of(&period, "a"), Some(5.0));
    }

    #[test]
    fn upsert_refreshes_content_even_when_score_is_lower() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = store.current_period();

        store.upsert(&period, item("a"), 5.0);
        let mut refreshed = item("a");
        refreshed.title = "edited".to_string();
        store.upsert(&period, refreshed, 1.0);

        assert_eq!(store.item("a").map(|i| i.title), Some("edited".to_string()));
        assert_eq!(store.score_of(&period, "a"), Some(5.0));
    }

    #[test]
    fn top_n_sorts_descending_and_breaks_ties_by_id() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = store.current_period();
        store.upsert(&period, item("c"), 2.0);
        store.upsert(&period, item("b"), 2.0);
        store.upsert(&period, item("a"), 1.0);
        store.upsert(&period, item("d"), 9.0);

        let ids: Vec<String> = store
            .top_n(&period, 3)
            .into_iter()
            .map(|s| s.item.id)
            .collect();

        assert_eq!(ids, vec!["d", "b", "c"]);
    }

    #[test]
    fn top_n_unknown_period_is_empty() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = Period::parse("1999-01-01").expect("valid");
        assert!(store.top_n(&period, 10).is_empty());
    }

    #[test]
    fn publish_marker_is_idempotent() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = store.current_period();

        assert!(!store.is_published("daily", &period));
        assert!(store.mark_published("daily", &period));
        assert!(!store.mark_published("daily", &period));
        assert!(store.is_published("daily", &period));
        assert!(!store.is_published("weekly", &period));
    }

    #[test]
    fn skip_marker_expires_and_is_evicted() {
        let (clock, store) = store_at("2025-11-08T12:00:00Z");

        store.mark_skipped("daily", "a", Duration::from_millis(1000));
        assert!(store.is_skipped("daily", "a"));
        assert_eq!(store.stats().skip_markers, 1);

        clock.advance(TimeDelta::milliseconds(1000));

        assert!(!store.is_skipped("daily", "a"));
        assert_eq!(store.stats().skip_markers, 0, "expired marker must be evicted");
    }

    #[test]
    fn skip_marker_is_scoped_per_channel() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        store.mark_skipped("daily", "a", Duration::from_secs(60));

        assert!(store.is_skipped("daily", "a"));
        assert!(!store.is_skipped("weekly", "a"));
    }

    #[test]
    fn commit_digest_refuses_second_publish() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = store.current_period();
        let ids = vec!["a".to_string(), "b".to_string()];

        assert!(store.commit_digest("daily", &period, &ids, Duration::from_secs(3600)));
        assert!(store.is_skipped("daily", "a"));
        assert!(store.is_skipped("daily", "b"));

        let again = vec!["c".to_string()];
        assert!(!store.commit_digest("daily", &period, &again, Duration::from_secs(3600)));
        assert!(!store.is_skipped("daily", "c"));
    }

    #[test]
    fn gc_drops_old_periods_and_expired_skips_only() {
        let (clock, store) = store_at("2025-11-01T12:00:00Z");
        let old = Period::parse("2025-11-01").expect("valid");
        let boundary = Period::parse("2025-11-08").expect("valid");
        let today = Period::parse("2025-11-15").expect("valid");

        store.upsert(&old, item("old"), 1.0);
        store.upsert(&boundary, item("edge"), 1.0);
        store.upsert(&today, item("new"), 1.0);
        store.mark_skipped("daily", "short", Duration::from_secs(60));
        store.mark_skipped("daily", "long", Duration::from_secs(30 * 24 * 3600));

        clock.set(parse_utc("2025-11-15T12:00:00Z"));
        let report = store.gc();

        assert_eq!(report.dropped_periods, 1);
        assert_eq!(report.expired_skips, 1);
        assert_eq!(report.dropped_items, 1);
        assert!(store.top_n(&old, 10).is_empty());
        assert_eq!(store.top_n(&boundary, 10).len(), 1);
        assert_eq!(store.top_n(&today, 10).len(), 1);
        assert!(store.is_skipped("daily", "long"));
        assert!(store.item("old").is_none());
    }

    #[test]
    fn snapshot_restore_round_trip_preserves_state() {
        let (_, store) = store_at("2025-11-08T12:00:00Z");
        let period = store.current_period();
        store.upsert(&period, item("a"), 4.0);
        store.mark_published("daily", &period);
        store.mark_skipped("daily", "a", Duration::from_secs(3600));

        let (_, restored) = store_at("2025-11-08T12:00:00Z");
        restored.restore(store.snapshot());

        assert_eq!(restored.score_of(&period, "a"), Some(4.0));
        assert!(restored.is_published("daily", &period));
        assert!(restored.is_skipped("daily", "a"));
        assert_eq!(restored.stats(), store.stats());
    }

    #[tokio::test]
    async fn persist_then_load_restores_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let clock = Arc::new(ManualClock::new(parse_utc("2025-11-08T12:00:00Z")));
        let store = RankedStore::new(&path, clock.clone(), utc());
        let period = store.current_period();
        store.upsert(&period, item("a"), 2.5);
        store.mark_published("daily", &period);
        store.persist().await.expect("persist");

        let reloaded = RankedStore::new(&path, clock, utc());
        assert_eq!(reloaded.load().await, LoadOutcome::Restored);
        assert_eq!(reloaded.score_of(&period, "a"), Some(2.5));
        assert!(reloaded.is_published("daily", &period));
    }

    #[tokio::test]
    async fn load_missing_file_is_noop() {
        let dir = tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(parse_utc("2025-11-08T12:00:00Z")));
        let store = RankedStore::new(dir.path().join("absent.json"), clock, utc());

        assert_eq!(store.load().await, LoadOutcome::Missing);
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[tokio::test]
    async fn load_corrupt_file_starts_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, b"\x00garbage").await.expect("write");
        let clock = Arc::new(ManualClock::new(parse_utc("2025-11-08T12:00:00Z")));
        let store = RankedStore::new(&path, clock, utc());

        assert_eq!(store.load().await, LoadOutcome::StartedEmpty);
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[tokio::test]
    async fn load_corrupt_file_falls_back_to_backup() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let clock = Arc::new(ManualClock::new(parse_utc("2025-11-08T12:00:00Z")));
        let store = RankedStore::new(&path, clock.clone(), utc());
        let period = store.current_period();
        store.mark_published("daily", &period);
        store.persist().await.expect("first persist");
        store.persist().await.expect("second persist rotates backup");
        tokio::fs::write(&path, b"{truncated").await.expect("corrupt");

        let reloaded = RankedStore::new(&path, clock, utc());
        assert_eq!(reloaded.load().await, LoadOutcome::RestoredFromBackup);
        assert!(reloaded.is_published("daily", &period));
    }
}
