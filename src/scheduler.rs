pub mod daemon;

use async_trait::async_trait;

pub use daemon::spawn_periodic;

/// 定期実行されるタスク。1 回の `tick` が終わるまで次の `tick` は始まらない。
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}
