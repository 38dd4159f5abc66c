use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

use crate::scheduler::PeriodicTask;

/// `task` を `period` 間隔で実行するループを起動する。
///
/// 最初の tick は即座に実行される。間隔は tick の開始時刻から測り、tick が間隔を超えた場合は
/// 取りこぼした分をまとめて実行せずに次の境界まで待つ。キャンセルは tick と tick の間でのみ
/// 観測されるため、実行中の tick は必ず最後まで走る。
pub fn spawn_periodic(
    task: Arc<dyn PeriodicTask>,
    period: Duration,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    TaskDaemon::new(task, period, shutdown_token).spawn()
}

struct TaskDaemon {
    task: Arc<dyn PeriodicTask>,
    period: Duration,
    shutdown_token: CancellationToken,
}

impl TaskDaemon {
    fn new(task: Arc<dyn PeriodicTask>, period: Duration, shutdown_token: CancellationToken) -> Self {
        Self {
            task,
            period,
            shutdown_token,
        }
    }

    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let name = self.task.name();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            task = name,
            interval_secs = self.period.as_secs(),
            "periodic task started"
        );

        loop {
            tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let tick_id = Uuid::new_v4();
            let started = Instant::now();
            self.task
                .tick()
                .instrument(info_span!("tick", task = name, %tick_id))
                .await;
            debug!(
                task = name,
                %tick_id,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "tick finished"
            );
        }

        info!(task = name, "periodic task stopped");
    }
}
