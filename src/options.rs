use std::time::Duration;

use serde::Deserialize;

/// ストアキーの既定プレフィックス。
pub const DEFAULT_KEY_PREFIX: &str = "redis:lock:";
/// ブロッキング待機の既定上限。
pub const DEFAULT_BLOCK_WAIT: Duration = Duration::from_secs(5);
/// ロックの既定 TTL。
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(30);
/// ウォッチドッグの既定の更新間隔。
pub const DEFAULT_WATCHDOG_STEP: Duration = Duration::from_secs(5);
/// 更新時に間隔へ上乗せする TTL の余裕。
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(5);

/// RedLock のノード単位の取得予算の既定値。
pub const DEFAULT_SINGLE_NODE_TIMEOUT: Duration = Duration::from_millis(50);
/// RedLock の全ノード共通 TTL の既定値。
pub const DEFAULT_REDLOCK_EXPIRE: Duration = Duration::from_secs(5);

/// 単一ノードロックの設定。
///
/// `expire` を明示しなかった場合（またはゼロの場合）は既定 TTL が適用され、
/// 更新なしでは危険なためウォッチドッグが強制的に有効になる。
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    pub blocking: bool,
    pub block_wait: Duration,
    pub expire: Option<Duration>,
    pub watchdog: bool,
    pub watchdog_step: Duration,
    pub renewal_margin: Duration,
    pub key_prefix: String,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            blocking: false,
            block_wait: DEFAULT_BLOCK_WAIT,
            expire: None,
            watchdog: false,
            watchdog_step: DEFAULT_WATCHDOG_STEP,
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn with_block_wait(mut self, wait: Duration) -> Self {
        self.block_wait = wait;
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn with_watchdog(mut self) -> Self {
        self.watchdog = true;
        self
    }

    pub fn with_watchdog_step(mut self, step: Duration) -> Self {
        self.watchdog_step = step;
        self
    }

    pub fn with_renewal_margin(mut self, margin: Duration) -> Self {
        self.renewal_margin = margin;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// 既定値で補正した設定を返す。
    pub fn repaired(mut self) -> Self {
        if self.blocking && self.block_wait.is_zero() {
            self.block_wait = DEFAULT_BLOCK_WAIT;
        }
        match self.expire {
            Some(expire) if !expire.is_zero() => {}
            _ => {
                self.expire = Some(DEFAULT_EXPIRE);
                self.watchdog = true;
            }
        }
        if self.watchdog_step.is_zero() {
            self.watchdog_step = DEFAULT_WATCHDOG_STEP;
        }
        self
    }

    /// 補正後の TTL。
    pub fn expire(&self) -> Duration {
        self.expire.filter(|e| !e.is_zero()).unwrap_or(DEFAULT_EXPIRE)
    }

    /// ウォッチドッグの更新間隔。TTL より長くはならない。
    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_step.min(self.expire())
    }

    /// ウォッチドッグが 1 回の更新で設定する TTL。
    pub fn renewal_ttl(&self) -> Duration {
        self.watchdog_interval() + self.renewal_margin
    }
}

/// RedLock の設定。
#[derive(Debug, Clone, PartialEq)]
pub struct RedLockOptions {
    pub single_node_timeout: Duration,
    pub expire: Duration,
    pub key_prefix: String,
}

impl Default for RedLockOptions {
    fn default() -> Self {
        Self {
            single_node_timeout: DEFAULT_SINGLE_NODE_TIMEOUT,
            expire: DEFAULT_REDLOCK_EXPIRE,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RedLockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_single_node_timeout(mut self, timeout: Duration) -> Self {
        self.single_node_timeout = timeout;
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn repaired(mut self) -> Self {
        if self.single_node_timeout.is_zero() {
            self.single_node_timeout = DEFAULT_SINGLE_NODE_TIMEOUT;
        }
        if self.expire.is_zero() {
            self.expire = DEFAULT_REDLOCK_EXPIRE;
        }
        self
    }

    /// 各メンバーロックに適用する設定。TTL は明示されるためウォッチドッグは動かない。
    pub fn member_options(&self) -> LockOptions {
        LockOptions::new()
            .with_expire(self.expire)
            .with_key_prefix(self.key_prefix.clone())
    }
}

/// 設定ファイルから読み込む単一ノードロックの設定。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub blocking: bool,
    pub block_wait_secs: u64,
    pub expire_secs: u64,
    pub watchdog: bool,
    pub watchdog_step_secs: Option<u64>,
    pub renewal_margin_secs: Option<u64>,
    pub key_prefix: Option<String>,
}

impl From<LockConfig> for LockOptions {
    fn from(cfg: LockConfig) -> Self {
        let mut opts = LockOptions::new();
        opts.blocking = cfg.blocking;
        opts.block_wait = Duration::from_secs(cfg.block_wait_secs);
        if cfg.expire_secs > 0 {
            opts.expire = Some(Duration::from_secs(cfg.expire_secs));
        }
        opts.watchdog = cfg.watchdog;
        if let Some(step) = cfg.watchdog_step_secs {
            opts.watchdog_step = Duration::from_secs(step);
        }
        if let Some(margin) = cfg.renewal_margin_secs {
            opts.renewal_margin = Duration::from_secs(margin);
        }
        if let Some(prefix) = cfg.key_prefix {
            opts.key_prefix = prefix;
        }
        opts.repaired()
    }
}

/// 設定ファイルから読み込む RedLock の設定。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedLockConfig {
    pub single_node_timeout_ms: u64,
    pub expire_ms: u64,
    pub key_prefix: Option<String>,
}

impl From<RedLockConfig> for RedLockOptions {
    fn from(cfg: RedLockConfig) -> Self {
        let mut opts = RedLockOptions::new()
            .with_single_node_timeout(Duration::from_millis(cfg.single_node_timeout_ms))
            .with_expire(Duration::from_millis(cfg.expire_ms));
        if let Some(prefix) = cfg.key_prefix {
            opts.key_prefix = prefix;
        }
        opts.repaired()
    }
}
