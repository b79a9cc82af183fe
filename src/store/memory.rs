use super::{KvStore, StoreResult};
use crate::clock::Clock;
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 每写入这么多次做一次全量过期清扫
const SWEEP_EVERY_WRITES: u64 = 1024;

struct Entry {
    value: String,
    /// 过期时间（Unix 毫秒），None 表示永不过期
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// 进程内键值存储 - 单机开发与测试使用
///
/// 语义对齐 Redis：INCR 保留原有 TTL，EXPIRE 对不存在的键无效，
/// 对非整数值 INCR 报错。过期条目在访问时懒清理，
/// 另外每 `SWEEP_EVERY_WRITES` 次写入整体清扫一遍，不再出现的指纹也会被回收。
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// 当前条目数（含尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 删除所有已过期的条目，返回删除数量
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!("[MemoryStore] 清理过期条目 {} 个", removed);
        }
        removed
    }

    /// 记一次写入，到达间隔时清扫；调用方此时不能持有任何条目引用
    fn note_write(&self) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % SWEEP_EVERY_WRITES == 0 {
            self.sweep_expired();
        }
    }

    fn deadline(&self, ttl: Duration) -> i64 {
        let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(ms)
    }

    fn incr_entry(&self, key: &str) -> StoreResult<i64> {
        let now = self.clock.now_millis();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });

        if entry.is_expired(now) {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }

        let current: i64 = entry.value.parse().map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
        })?;
        let next = current.checked_add(1).ok_or_else(|| StoreError::InvalidValue {
            key: key.to_string(),
        })?;
        entry.value = next.to_string();
        Ok(next)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_millis();
        // 先释放读引用再删除，避免同一分片上的死锁
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Some(self.deadline(ttl)),
        };
        self.entries.insert(key.to_string(), entry);
        self.note_write();
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let result = self.incr_entry(key);
        self.note_write();
        result
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let deadline = self.deadline(ttl);
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(deadline);
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}
