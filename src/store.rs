pub mod models;
pub mod ranked;
pub mod raw_cache;
pub mod snapshot;

pub use models::{Item, Period, ScoredItem};
pub use ranked::{GcReport, LoadOutcome, RankedStore, StoreStats};
pub use raw_cache::RawCacheDir;
pub use snapshot::{Snapshot, SnapshotError};
