//! 递进锁定状态机
//!
//! 每个 (端点, 指纹) 组合有三种状态：Clear（无计数无封禁）、
//! Accumulating（失败计数 < 阈值）、Blocked（存在未过期的封禁标记）。
//!
//! 状态机本身不加锁，并发正确性完全依赖存储的原子 INCR/EXPIRE。
//! 同一指纹的两个并发失败请求可能各自判断是否越过阈值，最坏结果是多放过一次尝试。

pub mod policy;

pub use policy::*;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::metrics::{Metrics, METRICS};
use crate::store::{KvBackend, StoreResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// 某个 (端点, 指纹) 组合在存储中的三个键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutKeys {
    pub attempts: String,
    pub blocks: String,
    pub blocked: String,
}

impl LockoutKeys {
    pub fn new(namespace: &str, endpoint: &str, fingerprint: &Fingerprint) -> Self {
        let base = format!("{}:{}:{}", namespace, endpoint, fingerprint.as_str());
        Self {
            attempts: format!("{}:attempts", base),
            blocks: format!("{}:blocks", base),
            blocked: format!("{}:blocked", base),
        }
    }
}

/// 封禁检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Open,
    /// 剩余秒数向上取整，封禁期间不会出现 0
    Blocked { remaining_secs: u64 },
}

impl BlockStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockStatus::Blocked { .. })
    }
}

/// 记录一次失败后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureOutcome {
    pub blocked: bool,
    pub attempts: u64,
    pub block_duration_secs: Option<u64>,
}

/// 诊断信息，只给内部管理接口使用，绝不返回给被限流的客户端
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockoutStats {
    pub attempts: u64,
    pub block_count: u64,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// 锁定引擎
///
/// 所有存储错误都在这里被吞掉并降级为放行（fail-open），调用方只会拿到判定结果。
pub struct LockoutEngine {
    backend: KvBackend,
    policy: LockoutPolicy,
    clock: Arc<dyn Clock>,
}

impl LockoutEngine {
    pub fn new(backend: KvBackend, policy: LockoutPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            policy,
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    fn keys(&self, endpoint: &str, fingerprint: &Fingerprint) -> LockoutKeys {
        LockoutKeys::new(&self.policy.namespace, endpoint, fingerprint)
    }

    /// 检查是否处于封禁中
    pub async fn check_blocked(&self, endpoint: &str, fingerprint: &Fingerprint) -> BlockStatus {
        if !self.is_enabled() {
            return BlockStatus::Open;
        }

        let status = match self.try_check_blocked(endpoint, fingerprint).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("[Lockout] 检查封禁状态失败，放行: {}", e);
                BlockStatus::Open
            }
        };

        let label = if status.is_blocked() { "blocked" } else { "open" };
        METRICS.lockout_checks.with_label_values(&[label]).inc();
        status
    }

    async fn try_check_blocked(
        &self,
        endpoint: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<BlockStatus> {
        let keys = self.keys(endpoint, fingerprint);

        let Some(raw) = self.backend.get(&keys.blocked).await? else {
            return Ok(BlockStatus::Open);
        };

        let now = self.clock.now_millis();
        match raw.trim().parse::<i64>() {
            Ok(unblock_at) if now < unblock_at => Ok(BlockStatus::Blocked {
                remaining_secs: ceil_secs(unblock_at - now),
            }),
            Ok(_) => {
                // 标记已过期但还没被存储清掉（时钟偏差 / TTL 粒度），顺手删除
                tracing::debug!("[Lockout] 清理过期封禁标记: {}", fingerprint);
                self.backend.del(&keys.blocked).await?;
                Ok(BlockStatus::Open)
            }
            Err(_) => {
                tracing::warn!("[Lockout] 封禁标记格式错误，按不存在处理: {}", fingerprint);
                self.backend.del(&keys.blocked).await?;
                Ok(BlockStatus::Open)
            }
        }
    }

    /// 记录一次失败，达到阈值时按历史封禁次数施加递进封禁
    pub async fn record_failure(&self, endpoint: &str, fingerprint: &Fingerprint) -> FailureOutcome {
        if !self.is_enabled() {
            return FailureOutcome::default();
        }

        match self.try_record_failure(endpoint, fingerprint).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("[Lockout] 记录失败尝试出错: {}", e);
                FailureOutcome::default()
            }
        }
    }

    async fn try_record_failure(
        &self,
        endpoint: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<FailureOutcome> {
        let keys = self.keys(endpoint, fingerprint);

        let attempts = self.incr_counter(&keys.attempts, self.policy.attempts_ttl).await?;
        self.backend.expire(&keys.attempts, self.policy.attempts_ttl).await?;

        if attempts < self.policy.max_attempts {
            tracing::debug!(
                "[Lockout] {} 端点 {} 失败 {}/{}",
                fingerprint,
                endpoint,
                attempts,
                self.policy.max_attempts
            );
            return Ok(FailureOutcome {
                blocked: false,
                attempts,
                block_duration_secs: None,
            });
        }

        // 1. 读取历史封禁次数
        let block_count = parse_counter(&keys.blocks, self.backend.get(&keys.blocks).await?);

        // 2. 按递进表选择封禁时长
        let duration = self.policy.escalation.duration_for(block_count);
        let duration_ms = i64::try_from(duration.saturating_mul(1000)).unwrap_or(i64::MAX);
        let unblock_at = self.clock.now_millis().saturating_add(duration_ms);

        // 3. 写入封禁标记：存绝对解封时间，剩余时间不受存储 TTL 粒度影响
        self.backend
            .set_with_ttl(
                &keys.blocked,
                &unblock_at.to_string(),
                Duration::from_secs(duration),
            )
            .await?;

        // 4. 累加封禁次数并刷新 7 天保留期
        self.incr_counter(&keys.blocks, self.policy.block_count_ttl).await?;
        self.backend.expire(&keys.blocks, self.policy.block_count_ttl).await?;

        // 5. 清空失败计数，解封后重新累计
        self.backend.del(&keys.attempts).await?;

        METRICS
            .lockout_blocks
            .with_label_values(&[Metrics::offense_label(block_count + 1)])
            .inc();
        tracing::warn!(
            "[Lockout] 封禁客户端 {} (端点 {}，第 {} 次，{} 秒)",
            fingerprint,
            endpoint,
            block_count + 1,
            duration
        );

        Ok(FailureOutcome {
            blocked: true,
            attempts,
            block_duration_secs: Some(duration),
        })
    }

    /// 原子递增计数；存量值不是整数时按 0 处理，直接覆盖为 1
    async fn incr_counter(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        match self.backend.incr(key).await {
            Ok(n) => Ok(u64::try_from(n).unwrap_or(0)),
            Err(StoreError::InvalidValue { .. }) => {
                tracing::warn!("[Lockout] 计数格式错误，重置为 1");
                self.backend.set_with_ttl(key, "1", ttl).await?;
                Ok(1)
            }
            Err(e) => Err(e),
        }
    }

    /// 成功后只清空失败计数：不解除已有封禁，也不遗忘封禁历史
    pub async fn record_success(&self, endpoint: &str, fingerprint: &Fingerprint) {
        if !self.is_enabled() {
            return;
        }

        let keys = self.keys(endpoint, fingerprint);
        if let Err(e) = self.backend.del(&keys.attempts).await {
            tracing::error!("[Lockout] 重置失败计数出错: {}", e);
        }
    }

    /// 诊断用统计；存储禁用或不可用时返回 None
    pub async fn stats(&self, endpoint: &str, fingerprint: &Fingerprint) -> Option<LockoutStats> {
        if !self.is_enabled() {
            return None;
        }

        match self.try_stats(endpoint, fingerprint).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::error!("[Lockout] 读取统计失败: {}", e);
                None
            }
        }
    }

    async fn try_stats(&self, endpoint: &str, fingerprint: &Fingerprint) -> StoreResult<LockoutStats> {
        let keys = self.keys(endpoint, fingerprint);

        let (attempts, blocks, blocked) = tokio::try_join!(
            self.backend.get(&keys.attempts),
            self.backend.get(&keys.blocks),
            self.backend.get(&keys.blocked),
        )?;

        let blocked_until = blocked
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);

        Ok(LockoutStats {
            attempts: parse_counter(&keys.attempts, attempts),
            block_count: parse_counter(&keys.blocks, blocks),
            blocked_until,
        })
    }
}

/// 解析计数，不存在或格式错误都视为 0
fn parse_counter(key: &str, raw: Option<String>) -> u64 {
    match raw {
        None => 0,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("[Lockout] 计数格式错误，按 0 处理: {}", key);
            0
        }),
    }
}

/// 毫秒转秒，向上取整
fn ceil_secs(ms: i64) -> u64 {
    let ms = u64::try_from(ms).unwrap_or(0);
    ms.div_ceil(1000)
}
