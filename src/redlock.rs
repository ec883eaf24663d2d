//! 複数の独立したストアに対する過半数ロック（RedLock）。

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::lock::LeaseLock;
use crate::options::RedLockOptions;
use crate::store::LockStore;
use crate::LockError;

/// 最小ノード数。これ未満では単一ロックに対する耐障害性がない。
pub const MIN_NODES: usize = 3;

/// RedLock は N 個の `LeaseLock` を束ね、過半数の取得をもってロック成立とする。
///
/// 各ノードへの取得は並行に発行し、ノードごとに `single_node_timeout` で打ち切る。
/// 成功と数えるのは、取得に成功し、かつ所要時間が予算以内だったノードのみ。
pub struct RedLock {
    locks: Vec<LeaseLock>,
    options: RedLockOptions,
}

impl RedLock {
    pub fn new(
        key: &str,
        stores: Vec<Arc<dyn LockStore>>,
        options: RedLockOptions,
    ) -> Result<Self, LockError> {
        let nodes = stores.len();
        if nodes < MIN_NODES {
            return Err(LockError::TooFewNodes { nodes });
        }

        let options = options.repaired();
        let worst_case = u32::try_from(nodes)
            .ok()
            .and_then(|n| options.single_node_timeout.checked_mul(n))
            .and_then(|d| d.checked_mul(10));
        if worst_case.map_or(true, |d| d > options.expire) {
            return Err(LockError::NodeTimeoutTooLong {
                nodes,
                single_node_timeout: options.single_node_timeout,
                expire: options.expire,
            });
        }

        let locks = stores
            .into_iter()
            .map(|store| LeaseLock::new(key, store, options.member_options()))
            .collect();
        Ok(Self { locks, options })
    }

    pub fn node_count(&self) -> usize {
        self.locks.len()
    }

    /// ロック成立に必要なノード数（厳密な過半数）。
    pub fn quorum(&self) -> usize {
        self.locks.len() / 2 + 1
    }

    pub fn options(&self) -> &RedLockOptions {
        &self.options
    }

    /// 過半数のノードでロックを取得する。
    ///
    /// 過半数に届かなかった場合は全ノードを解放してから `QuorumNotReached` を返す。
    /// この解放は呼び出し元のキャンセルに関係なく行い、ノードごとに
    /// `single_node_timeout` で打ち切る。
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        let attempts = self.locks.iter().map(|lock| self.lock_member(lock, cancel));
        let acquired = join_all(attempts).await.into_iter().filter(|ok| *ok).count();
        let required = self.quorum();

        if acquired < required {
            tracing::info!(acquired, required, "quorum not reached, rolling back");
            self.release_members(&CancellationToken::new()).await;
            return Err(LockError::QuorumNotReached { acquired, required });
        }
        tracing::info!(acquired, required, "redlock acquired");
        Ok(())
    }

    /// 全ノードのロックを解放する。個別の失敗は無視し、残ったキーは TTL で失効させる。
    ///
    /// 各ノードへの解放は `single_node_timeout` か `cancel` で打ち切る。
    pub async fn unlock(&self, cancel: &CancellationToken) {
        self.release_members(cancel).await;
    }

    async fn release_members(&self, cancel: &CancellationToken) {
        let budget = self.options.single_node_timeout;
        let releases = self
            .locks
            .iter()
            .map(|lock| tokio::time::timeout(budget, lock.unlock(cancel)));
        let results = join_all(releases).await;
        for (lock, result) in self.locks.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(key = %lock.key(), error = %e, "member unlock skipped")
                }
                Err(_) => tracing::debug!(key = %lock.key(), ?budget, "member unlock timed out"),
            }
        }
    }

    async fn lock_member(&self, lock: &LeaseLock, cancel: &CancellationToken) -> bool {
        let budget = self.options.single_node_timeout;
        let child = cancel.child_token();
        let started = Instant::now();
        let outcome = tokio::time::timeout(budget, lock.lock(&child)).await.ok();
        let elapsed = started.elapsed();
        child.cancel();

        if let Some(Err(e)) = &outcome {
            tracing::debug!(key = %lock.key(), error = %e, "member lock failed");
        }
        counts_toward_quorum(outcome.as_ref(), elapsed, budget)
    }
}

/// メンバーの取得結果を過半数の 1 票と数えるか。`outcome` が `None` なら予算切れ。
///
/// 取得に成功していても所要時間が予算を超えたものは、残り TTL を信頼できないため数えない。
/// `timeout` は内側の完了を先に判定するため、締め切りと同時に完了した取得はここで弾く。
fn counts_toward_quorum(
    outcome: Option<&Result<(), LockError>>,
    elapsed: Duration,
    budget: Duration,
) -> bool {
    match outcome {
        Some(Ok(())) if elapsed <= budget => true,
        Some(Ok(())) => {
            tracing::debug!(?elapsed, ?budget, "member acquired too slowly");
            false
        }
        Some(Err(_)) => false,
        None => {
            tracing::debug!(?budget, "member lock timed out");
            false
        }
    }
}
