//! k1s0-redlock: キー・バリューストアを使った分散排他ロック。
//!
//! ウォッチドッグで TTL を自動延長する単一ノードロック（`LeaseLock`）と、
//! 複数ノードの過半数で成立するロック（`RedLock`）を提供する。

pub mod error;
pub mod lock;
pub mod memory;
pub mod options;
#[cfg(feature = "redis")]
pub mod redis;
pub mod redlock;
pub mod store;
pub mod token;
mod watchdog;

pub use error::{is_retryable, LockError, LockErrorKind};
pub use lock::LeaseLock;
pub use memory::InMemoryLockStore;
pub use options::{LockConfig, LockOptions, RedLockConfig, RedLockOptions};
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use redlock::RedLock;
pub use store::LockStore;
pub use token::generate_token;

#[cfg(feature = "mock")]
pub use store::MockLockStore;
