//! Time-decayed popularity score.

use chrono::{DateTime, Utc};

use crate::store::Item;

/// Decay exponent applied to the age term.
const GRAVITY: f64 = 1.8;
/// Hours added to the age so fresh items do not divide by ~0.
const AGE_OFFSET_HOURS: f64 = 2.0;
const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// `(replies - 1) / (hours_since_post + 2)^1.8`, clamped to `0.0`.
///
/// Returns exactly `0.0` for items without replies and for any negative or
/// non-finite intermediate result. Future timestamps count as zero elapsed.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_score(item: &Item, now: DateTime<Utc>) -> f64 {
    if item.replies == 0 {
        return 0.0;
    }

    let elapsed_ms = (now - item.created).num_milliseconds();
    let hours = (elapsed_ms as f64 / MILLIS_PER_HOUR).max(0.0);
    let score = (f64::from(item.replies) - 1.0) / (hours + AGE_OFFSET_HOURS).powf(GRAVITY);

    if score.is_finite() && score > 0.0 {
        score
    } else {
        0.0
    }
}
