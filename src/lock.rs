use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::options::LockOptions;
use crate::store::LockStore;
use crate::token::generate_token;
use crate::watchdog::Watchdog;
use crate::LockError;

/// ブロッキング取得時のポーリング間隔。
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 1 つのキーとトークンの組。ストアへの原子操作をまとめる。
#[derive(Clone)]
pub(crate) struct Lease {
    pub(crate) store: Arc<dyn LockStore>,
    pub(crate) key: String,
    pub(crate) token: String,
}

impl Lease {
    async fn acquire(&self, ttl: Duration) -> Result<(), LockError> {
        if self.store.set_if_absent(&self.key, &self.token, ttl).await? {
            Ok(())
        } else {
            Err(LockError::AlreadyLocked {
                key: self.key.clone(),
            })
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        match self.store.compare_and_delete(&self.key, &self.token).await? {
            1 => Ok(()),
            _ => Err(LockError::UnlockWithoutOwnership {
                key: self.key.clone(),
            }),
        }
    }

    pub(crate) async fn extend(&self, ttl: Duration) -> Result<(), LockError> {
        match self
            .store
            .compare_and_extend(&self.key, &self.token, ttl)
            .await?
        {
            1 => Ok(()),
            _ => Err(LockError::ExpireWithoutOwnership {
                key: self.key.clone(),
            }),
        }
    }
}

/// 単一ストアに対する TTL 付き排他ロック。
///
/// 非再入。トークンはインスタンス生成時に一度だけ作られ、所有権の確認は
/// 毎回ストアへ問い合わせる。ウォッチドッグ有効時は保持中に TTL を自動延長する。
///
/// ```ignore
/// let lock = LeaseLock::new("order:42", store, LockOptions::new().with_block());
/// lock.lock(&cancel).await?;
/// // クリティカルセクション
/// lock.unlock(&cancel).await?;
/// ```
pub struct LeaseLock {
    lease: Lease,
    options: LockOptions,
    watchdog: Watchdog,
}

impl LeaseLock {
    pub fn new(key: &str, store: Arc<dyn LockStore>, options: LockOptions) -> Self {
        Self::with_token(key, store, options, generate_token())
    }

    /// 呼び出し側が用意したトークンで生成する。
    pub fn with_token(
        key: &str,
        store: Arc<dyn LockStore>,
        options: LockOptions,
        token: impl Into<String>,
    ) -> Self {
        let options = options.repaired();
        Self {
            lease: Lease {
                store,
                key: format!("{}{}", options.key_prefix, key),
                token: token.into(),
            },
            options,
            watchdog: Watchdog::new(),
        }
    }

    /// ストア上のキー（プレフィックス込み）。
    pub fn key(&self) -> &str {
        &self.lease.key
    }

    pub fn token(&self) -> &str {
        &self.lease.token
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn is_watchdog_running(&self) -> bool {
        self.watchdog.is_running()
    }

    /// ロックを取得する。
    ///
    /// まず 1 回だけ即時取得を試みる。競合時、ブロッキング設定なら
    /// `BLOCK_POLL_INTERVAL` 間隔でポーリングし、待機上限かキャンセルで失敗する。
    /// 取得に成功しウォッチドッグが有効なら、`cancel` の子トークンで更新タスクを起動する。
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        let result = match self.try_lock(cancel).await {
            Ok(()) => Ok(()),
            Err(e) if !self.options.blocking || !e.is_retryable() => Err(e),
            Err(e) => self.blocking_lock(cancel, e).await,
        };

        if result.is_ok() {
            tracing::debug!(key = %self.lease.key, "lock acquired");
            if self.options.watchdog {
                self.watchdog
                    .start(
                        cancel,
                        self.lease.clone(),
                        self.options.watchdog_interval(),
                        self.options.renewal_ttl(),
                    )
                    .await;
            }
        }
        result
    }

    /// トークンが一致する場合のみロックを解放し、ウォッチドッグを停止する。
    ///
    /// ストアの応答より先に `cancel` が発火した場合は `Cancelled` を返す。
    pub async fn unlock(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled()),
            res = self.lease.release() => res?,
        }
        self.watchdog.stop();
        tracing::debug!(key = %self.lease.key, "lock released");
        Ok(())
    }

    /// トークンが一致する場合のみ TTL を `ttl` に更新する。
    pub async fn delay_expire(
        &self,
        cancel: &CancellationToken,
        ttl: Duration,
    ) -> Result<(), LockError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.cancelled()),
            res = self.lease.extend(ttl) => res,
        }
    }

    async fn try_lock(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        if cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.cancelled()),
            res = self.lease.acquire(self.options.expire()) => res,
        }
    }

    async fn blocking_lock(
        &self,
        cancel: &CancellationToken,
        mut last: LockError,
    ) -> Result<(), LockError> {
        let started = Instant::now();
        let deadline = started + self.options.block_wait;
        let mut ticker = interval_at(started + BLOCK_POLL_INTERVAL, BLOCK_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = ticker.tick() => {}
            }

            // キャンセル、待機上限、ポーリングの順で判定する
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            if Instant::now() >= deadline {
                return Err(LockError::BlockTimeout {
                    waited: started.elapsed(),
                    source: Box::new(last),
                });
            }

            match self.try_lock(cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
    }

    fn cancelled(&self) -> LockError {
        LockError::Cancelled {
            key: self.lease.key.clone(),
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        // 破棄後は延長しない。リースは TTL で失効する
        self.watchdog.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockErrorKind;
    use crate::memory::InMemoryLockStore;
    use crate::store::MockLockStore;

    fn memory_store() -> Arc<InMemoryLockStore> {
        Arc::new(InMemoryLockStore::new())
    }

    #[test]
    fn test_key_is_prefixed_and_token_fixed() {
        let lock = LeaseLock::new("job", memory_store(), LockOptions::new());
        assert_eq!(lock.key(), "redis:lock:job");
        let token = lock.token().to_string();
        assert_eq!(lock.token(), token);
        assert!(lock.options().watchdog);
    }

    #[tokio::test]
    async fn test_non_blocking_contention() {
        let store = memory_store();
        let opts = LockOptions::new().with_expire(Duration::from_secs(10));
        let a = LeaseLock::new("res", store.clone(), opts.clone());
        let b = LeaseLock::new("res", store.clone(), opts);
        let cancel = CancellationToken::new();

        a.lock(&cancel).await.unwrap();
        let err = b.lock(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Contention);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_error_is_not_retried_when_blocking() {
        let mut store = MockLockStore::new();
        store
            .expect_set_if_absent()
            .times(1)
            .returning(|_, _, _| Err(LockError::Store("connection refused".into())));

        let lock = LeaseLock::new(
            "res",
            Arc::new(store),
            LockOptions::new()
                .with_block()
                .with_expire(Duration::from_secs(1)),
        );
        let err = lock.lock(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Store);
    }

    #[tokio::test]
    async fn test_store_error_mid_poll_is_returned() {
        let mut store = MockLockStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_set_if_absent()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(false));
        store
            .expect_set_if_absent()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(LockError::Store("broken pipe".into())));

        let lock = LeaseLock::new(
            "res",
            Arc::new(store),
            LockOptions::new()
                .with_block()
                .with_expire(Duration::from_secs(1)),
        );
        let err = lock.lock(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LockError::Store(msg) if msg == "broken pipe"));
    }

    #[tokio::test]
    async fn test_unlock_maps_zero_to_ownership_error() {
        let mut store = MockLockStore::new();
        store
            .expect_compare_and_delete()
            .withf(|key, token| key == "redis:lock:res" && token == "tok")
            .returning(|_, _| Ok(0));

        let lock = LeaseLock::with_token(
            "res",
            Arc::new(store),
            LockOptions::new().with_expire(Duration::from_secs(1)),
            "tok",
        );
        let err = lock.unlock(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LockError::UnlockWithoutOwnership { .. }));
    }

    #[tokio::test]
    async fn test_delay_expire_maps_zero_to_ownership_error() {
        let mut store = MockLockStore::new();
        store
            .expect_compare_and_extend()
            .withf(|_, token, ttl| token == "tok" && *ttl == Duration::from_secs(9))
            .returning(|_, _, _| Ok(0));

        let lock = LeaseLock::with_token(
            "res",
            Arc::new(store),
            LockOptions::new().with_expire(Duration::from_secs(1)),
            "tok",
        );
        let err = lock
            .delay_expire(&CancellationToken::new(), Duration::from_secs(9))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::ExpireWithoutOwnership { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_lock() {
        let lock = LeaseLock::new("res", memory_store(), LockOptions::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = lock.lock(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_unlock_stops_watchdog() {
        let lock = LeaseLock::new("res", memory_store(), LockOptions::new());
        let cancel = CancellationToken::new();
        lock.lock(&cancel).await.unwrap();
        assert!(lock.is_watchdog_running());

        lock.unlock(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lock.is_watchdog_running());
    }

    #[tokio::test]
    async fn test_no_watchdog_with_explicit_expire() {
        let lock = LeaseLock::new(
            "res",
            memory_store(),
            LockOptions::new().with_expire(Duration::from_secs(5)),
        );
        lock.lock(&CancellationToken::new()).await.unwrap();
        assert!(!lock.is_watchdog_running());
    }

    #[tokio::test]
    async fn test_unlock_and_delay_expire_honour_cancellation() {
        // 期待値なしのモック: ストアに触れたらパニックする
        let store = MockLockStore::new();
        let lock = LeaseLock::with_token(
            "res",
            Arc::new(store),
            LockOptions::new().with_expire(Duration::from_secs(1)),
            "tok",
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lock.unlock(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Cancelled);
        let err = lock
            .delay_expire(&cancel, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Cancelled);
    }

    /// 2 回目の取得要求だけ `delay` かかる、常に競合するストア。
    struct OneSlowPollStore {
        calls: std::sync::Mutex<Vec<Instant>>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl LockStore for OneSlowPollStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, LockError> {
            let nth = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len()
            };
            if nth == 2 {
                tokio::time::sleep(self.delay).await;
            }
            Ok(false)
        }

        async fn compare_and_delete(&self, _: &str, _: &str) -> Result<i64, LockError> {
            Ok(0)
        }

        async fn compare_and_extend(&self, _: &str, _: &str, _: Duration) -> Result<i64, LockError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_does_not_burst() {
        let store = Arc::new(OneSlowPollStore {
            calls: std::sync::Mutex::new(Vec::new()),
            delay: Duration::from_millis(200),
        });
        let lock = LeaseLock::new(
            "res",
            store.clone(),
            LockOptions::new()
                .with_block()
                .with_block_wait(Duration::from_secs(1))
                .with_expire(Duration::from_secs(1)),
        );

        let err = lock.lock(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Timeout);

        // 遅い応答の後も取りこぼした間隔分をまとめて実行しない
        let calls = store.calls.lock().unwrap();
        assert!(calls.len() > 3);
        for pair in calls[1..].windows(2) {
            assert!(pair[1] - pair[0] >= BLOCK_POLL_INTERVAL);
        }
    }
}
