use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::lock::Lease;

/// 停止済みの前回タスクがフラグを解放するまでの待機間隔。
const START_BACKOFF: Duration = Duration::from_millis(10);

/// 保持中のロックの TTL を定期的に延長するバックグラウンドタスクの管理。
///
/// 1 つのロックに対して同時に動くタスクは高々 1 つ。
pub(crate) struct Watchdog {
    running: Arc<AtomicBool>,
    stop: Mutex<Option<CancellationToken>>,
}

/// タスク終了時（パニック含む）に実行中フラグを下ろす。
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 更新タスクを起動する。
    ///
    /// 稼働中のタスクがあれば何もしない。停止要求済みのタスクが残っている場合は
    /// フラグが解放されるまで待ってから起動する。
    pub(crate) async fn start(
        &self,
        parent: &CancellationToken,
        lease: Lease,
        interval: Duration,
        renewal_ttl: Duration,
    ) {
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            if self.has_live_task() {
                tracing::debug!(key = %lease.key, "watchdog already running");
                return;
            }
            tokio::select! {
                biased;
                _ = parent.cancelled() => {
                    tracing::debug!(key = %lease.key, "watchdog start abandoned");
                    return;
                }
                _ = tokio::time::sleep(START_BACKOFF) => {}
            }
        }

        let stop = parent.child_token();
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop.clone());

        let flag = RunningFlag(self.running.clone());
        tokio::spawn(async move {
            let _flag = flag;
            run(lease, interval, renewal_ttl, stop).await;
        });
    }

    /// 更新タスクに停止を通知する。
    pub(crate) fn stop(&self) {
        let token = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn has_live_task(&self) -> bool {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |t| !t.is_cancelled())
    }
}

async fn run(lease: Lease, interval: Duration, renewal_ttl: Duration, stop: CancellationToken) {
    tracing::debug!(key = %lease.key, ?interval, "watchdog started");
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if stop.is_cancelled() {
            break;
        }

        // 1 回の更新失敗は致命的ではない。所有権を失っていれば以降も失敗し続ける。
        // 停止要求は応答待ちの更新より優先する。
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = lease.extend(renewal_ttl) => result,
        };
        match result {
            Ok(()) => tracing::debug!(key = %lease.key, ?renewal_ttl, "lease renewed"),
            Err(e) => tracing::warn!(key = %lease.key, error = %e, "lease renewal failed"),
        }
    }
    tracing::debug!(key = %lease.key, "watchdog stopped");
}
