use std::time::Duration;

use thiserror::Error;

/// ロック操作のエラー種別。
///
/// `LockError` の各バリアントはいずれか 1 つの種別に分類される。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    /// 他のトークンがキーを保持している。ポーリングで再試行できる。
    Contention,
    /// 所有権のない解放・延長。
    Ownership,
    /// ブロッキング待機の上限を超えた。
    Timeout,
    /// 呼び出し元のキャンセル。
    Cancelled,
    /// 構築時の設定不正。
    Configuration,
    /// 過半数のノードでロックを取得できなかった。
    Quorum,
    /// ストアとの通信エラー。
    Store,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("ロックは他の所有者に取得されています: {key}")]
    AlreadyLocked { key: String },
    #[error("所有権のないロックは解放できません: {key}")]
    UnlockWithoutOwnership { key: String },
    #[error("所有権のないロックは延長できません: {key}")]
    ExpireWithoutOwnership { key: String },
    #[error("ブロッキング待機がタイムアウトしました ({waited:?}): {source}")]
    BlockTimeout {
        waited: Duration,
        #[source]
        source: Box<LockError>,
    },
    #[error("ロック取得がキャンセルされました: {key}")]
    Cancelled { key: String },
    #[error("RedLock には 3 ノード以上が必要です (指定: {nodes})")]
    TooFewNodes { nodes: usize },
    #[error(
        "ノード単位のタイムアウトが長すぎます: {nodes} * {single_node_timeout:?} * 10 > {expire:?}"
    )]
    NodeTimeoutTooLong {
        nodes: usize,
        single_node_timeout: Duration,
        expire: Duration,
    },
    #[error("過半数のノードでロックを取得できませんでした ({acquired}/{required})")]
    QuorumNotReached { acquired: usize, required: usize },
    #[error("ストアエラー: {0}")]
    Store(String),
}

impl LockError {
    pub fn kind(&self) -> LockErrorKind {
        match self {
            LockError::AlreadyLocked { .. } => LockErrorKind::Contention,
            LockError::UnlockWithoutOwnership { .. } | LockError::ExpireWithoutOwnership { .. } => {
                LockErrorKind::Ownership
            }
            LockError::BlockTimeout { .. } => LockErrorKind::Timeout,
            LockError::Cancelled { .. } => LockErrorKind::Cancelled,
            LockError::TooFewNodes { .. } | LockError::NodeTimeoutTooLong { .. } => {
                LockErrorKind::Configuration
            }
            LockError::QuorumNotReached { .. } => LockErrorKind::Quorum,
            LockError::Store(_) => LockErrorKind::Store,
        }
    }

    /// ポーリングで再試行してよいエラーかどうか。競合のみが該当する。
    pub fn is_retryable(&self) -> bool {
        self.kind() == LockErrorKind::Contention
    }

    pub fn is_ownership(&self) -> bool {
        self.kind() == LockErrorKind::Ownership
    }
}

pub fn is_retryable(err: &LockError) -> bool {
    err.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_only_contention_is_retryable() {
        let contention = LockError::AlreadyLocked {
            key: "redis:lock:a".to_string(),
        };
        assert!(contention.is_retryable());
        assert!(is_retryable(&contention));

        let not_retryable = [
            LockError::UnlockWithoutOwnership { key: "a".into() },
            LockError::ExpireWithoutOwnership { key: "a".into() },
            LockError::Cancelled { key: "a".into() },
            LockError::TooFewNodes { nodes: 2 },
            LockError::QuorumNotReached {
                acquired: 1,
                required: 2,
            },
            LockError::Store("connection refused".into()),
        ];
        for err in &not_retryable {
            assert!(!err.is_retryable(), "{err} は再試行不可であるべき");
        }
    }

    #[test]
    fn test_block_timeout_wraps_contention() {
        let err = LockError::BlockTimeout {
            waited: Duration::from_secs(5),
            source: Box::new(LockError::AlreadyLocked {
                key: "redis:lock:job".to_string(),
            }),
        };
        assert_eq!(err.kind(), LockErrorKind::Timeout);
        assert!(!err.is_retryable());
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("redis:lock:job"));
    }

    #[test]
    fn test_ownership_kind() {
        assert!(LockError::UnlockWithoutOwnership { key: "k".into() }.is_ownership());
        assert!(LockError::ExpireWithoutOwnership { key: "k".into() }.is_ownership());
        assert!(!LockError::Store("x".into()).is_ownership());
    }

    #[test]
    fn test_store_error_message() {
        let err = LockError::Store("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.kind(), LockErrorKind::Store);
    }
}
