use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// 期間キーの書式。ゼロ埋め ISO 形式なので辞書順 = 時系列順になる。
pub const PERIOD_FORMAT: &str = "%Y-%m-%d";

/// ソースから取得したトピック。取得後は不変として扱う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub node_name: String,
    #[serde(default)]
    pub node_title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub replies: u32,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// スコア付きのアイテム。ランキング結果や候補プールの要素。
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub item: Item,
    pub score: f64,
}

/// 暦日単位の期間キー。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Period(String);

impl Period {
    /// 指定オフセットでのローカル日付から期間を求める。
    #[must_use]
    pub fn from_instant(instant: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self::from_date(instant.with_timezone(&offset).date_naive())
    }

    #[must_use]
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.format(PERIOD_FORMAT).to_string())
    }

    /// # Errors
    /// `YYYY-MM-DD` 形式でない場合はエラーを返す。
    pub fn parse(raw: &str) -> Result<Self, chrono::ParseError> {
        let date = NaiveDate::parse_from_str(raw, PERIOD_FORMAT)?;
        Ok(Self::from_date(date))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.0, PERIOD_FORMAT).ok()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// マーカーの複合キー区切り文字。チャンネル名には含められない。
pub const KEY_SEPARATOR: char = '|';

pub(crate) fn composite_key(channel: &str, rest: &str) -> String {
    format!("{channel}{KEY_SEPARATOR}{rest}")
}

pub(crate) fn split_composite_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(KEY_SEPARATOR)
        .filter(|(channel, rest)| !channel.is_empty() && !rest.is_empty())
}
