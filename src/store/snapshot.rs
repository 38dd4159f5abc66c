//! Flat JSON snapshot of the ranked store.
//!
//! The snapshot is rebuilt wholesale on every persist. Writes go to a temp
//! file that is renamed over the target. A previous snapshot that still decodes
//! is copied to `<path>.bak` first; a corrupt one is never rotated.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

use super::models::Item;

/// Current on-disk schema version. Bump when the shape changes.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Items keyed by id.
    pub items: BTreeMap<String, Item>,
    /// Score tables keyed by period, then by item id.
    pub scores: BTreeMap<String, BTreeMap<String, f64>>,
    /// `channel|period` keys.
    pub published: Vec<String>,
    /// `channel|id` keys mapped to their expiry.
    pub skipped: BTreeMap<String, DateTime<Utc>>,
}

impl Snapshot {
    #[must_use]
    pub fn empty(saved_at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            items: BTreeMap::new(),
            scores: BTreeMap::new(),
            published: Vec::new(),
            skipped: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot at {path} has unsupported version {found} (expected {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u32,
}

#[must_use]
pub fn backup_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".bak");
    PathBuf::from(raw)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}

/// スナップショットを読み込む。ファイルが存在しない場合は `Ok(None)`。
///
/// # Errors
/// 読み込み失敗、JSON 不正、バージョン不一致の場合はエラーを返す。
pub async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    decode_snapshot(path, &bytes).map(Some)
}

fn decode_snapshot(path: &Path, bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    let probe: VersionProbe =
        serde_json::from_slice(bytes).map_err(|source| SnapshotError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

    // Unknown shapes are rejected, never migrated.
    if probe.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: probe.version,
            expected: SNAPSHOT_VERSION,
        });
    }

    serde_json::from_slice(bytes).map_err(|source| SnapshotError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// スナップショットを書き出す。直前のスナップショットが正常に読める場合のみ `.bak` に退避する。
///
/// # Errors
/// エンコードまたはファイル操作が失敗した場合はエラーを返す。
pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(SnapshotError::Encode)?;
    let io_err = |source: io::Error| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let tmp = temp_path(path);
    fs::write(&tmp, &bytes).await.map_err(io_err)?;

    // A primary that does not decode must not replace the last good backup.
    match fs::read(path).await {
        Ok(previous) => match decode_snapshot(path, &previous) {
            Ok(_) => fs::write(backup_path(path), &previous)
                .await
                .map_err(io_err)?,
            Err(error) => {
                warn!(error = %error, "previous snapshot is invalid, keeping existing backup");
            }
        },
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(io_err(source)),
    }

    fs::rename(&tmp, path).await.map_err(io_err)
}
