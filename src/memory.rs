use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::LockStore;
use crate::LockError;

struct LeaseEntry {
    value: String,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// プロセス内で完結する `LockStore` 実装。
///
/// 期限切れエントリは参照時に遅延削除する。テストや単一プロセス構成向け。
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, LeaseEntry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 有効なエントリの値を返す。
    pub async fn value_of(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        entries.get(key).map(|e| e.value.clone())
    }

    /// 有効なエントリの残り TTL を返す。
    pub async fn ttl_of(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        entries
            .get(key)
            .map(|e| e.expires_at.saturating_duration_since(Instant::now()))
    }

    pub async fn is_locked(&self, key: &str) -> bool {
        self.value_of(key).await.is_some()
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn purge_expired(entries: &mut HashMap<String, LeaseEntry>, key: &str) {
    if entries.get(key).map_or(false, |e| e.is_expired()) {
        entries.remove(key);
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            LeaseEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<i64, LockError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<i64, LockError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Instant::now() + ttl;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}
