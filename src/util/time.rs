/// 時刻取得の抽象化。
///
/// ストアやビルダーは「現在時刻」をこのトレイト経由で取得するため、
/// テストでは [`ManualClock`] を注入して TTL や期間の境界を決定的に検証できます。
use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手動で進める時計。テスト専用の用途を想定。
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = DateTime::parse_from_rfc3339("2025-03-01T00:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc);
        let clock = ManualClock::new(start);

        clock.advance(Duration::milliseconds(1500));

        assert_eq!(clock.now(), start + Duration::milliseconds(1500));
    }
}
