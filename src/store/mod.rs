//! 键值存储适配层
//!
//! 所有操作都显式返回 `Result<_, StoreError>`，是否放行由锁定状态机决定。
//! 未配置存储时适配器处于禁用状态：读返回“不存在”，写是成功的空操作。

pub mod memory;
pub mod redis_store;

pub use memory::*;
pub use redis_store::*;

use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

/// 带 TTL 的网络键值存储
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// 写入并设置过期时间
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// 原子递增，返回递增后的值；键不存在时从 0 开始
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// 刷新过期时间，键不存在时不做任何事
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    async fn healthy(&self) -> bool;

    /// 关闭共享连接（优雅退出时调用）
    async fn close(&self) {}
}

/// 存储健康状态（/api/health 使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Disabled,
    Up,
    Down,
}

impl StoreHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreHealth::Disabled => "disabled",
            StoreHealth::Up => "up",
            StoreHealth::Down => "down",
        }
    }
}

/// 进程内共享的存储句柄
///
/// 没有连接串就是 `Disabled`：限流整体降级为全部放行。
#[derive(Clone)]
pub enum KvBackend {
    Disabled,
    Enabled(Arc<dyn KvStore>),
}

impl KvBackend {
    pub fn disabled() -> Self {
        KvBackend::Disabled
    }

    pub fn new(store: Arc<dyn KvStore>) -> Self {
        KvBackend::Enabled(store)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, KvBackend::Enabled(_))
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self {
            KvBackend::Disabled => Ok(None),
            KvBackend::Enabled(store) => store.get(key).await,
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        match self {
            KvBackend::Disabled => Ok(()),
            KvBackend::Enabled(store) => store.set_with_ttl(key, value, ttl).await,
        }
    }

    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        match self {
            KvBackend::Disabled => Ok(0),
            KvBackend::Enabled(store) => store.incr(key).await,
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        match self {
            KvBackend::Disabled => Ok(()),
            KvBackend::Enabled(store) => store.expire(key, ttl).await,
        }
    }

    pub async fn del(&self, key: &str) -> StoreResult<()> {
        match self {
            KvBackend::Disabled => Ok(()),
            KvBackend::Enabled(store) => store.del(key).await,
        }
    }

    pub async fn health(&self) -> StoreHealth {
        match self {
            KvBackend::Disabled => StoreHealth::Disabled,
            KvBackend::Enabled(store) => {
                if store.healthy().await {
                    StoreHealth::Up
                } else {
                    StoreHealth::Down
                }
            }
        }
    }

    pub async fn close(&self) {
        if let KvBackend::Enabled(store) = self {
            store.close().await;
        }
    }
}
