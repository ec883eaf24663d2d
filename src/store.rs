use std::time::Duration;

use async_trait::async_trait;

use crate::LockError;

/// LockStore はロックが依存するキー・バリューストアの原子操作。
///
/// `compare_and_delete` と `compare_and_extend` は比較と変更が不可分で
/// なければならない（Redis なら Lua スクリプトで評価する）。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// キーが存在しない場合のみ `value` を TTL 付きで設定する。設定できたら true。
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// 値が `expected` と一致する場合のみキーを削除する。削除したら 1、それ以外は 0。
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<i64, LockError>;

    /// 値が `expected` と一致する場合のみ TTL を `ttl` に更新する。更新したら 1、それ以外は 0。
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<i64, LockError>;
}
