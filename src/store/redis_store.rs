use super::{KvStore, StoreResult};
use crate::error::StoreError;
use crate::metrics::METRICS;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// 连接失败后的冷却期，期间直接返回不可用，避免每个请求都重走一遍退避
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(30);

/// 建连重试策略
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// 单次建连超时（托管 Redis 建议 15 秒）
    pub connect_timeout: Duration,
    /// 最多尝试次数，用尽后返回致命的连接错误
    pub max_attempts: u32,
    /// 每次重试增加的等待时间
    pub backoff_step: Duration,
    /// 等待时间上限
    pub backoff_cap: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            max_attempts: 10,
            backoff_step: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(3),
        }
    }
}

impl ConnectPolicy {
    /// 第 attempt 次失败后的等待时间：100ms·attempt，封顶 3 秒
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt).min(self.backoff_cap)
    }
}

/// 建连过程的状态，只在建连互斥锁内读写
struct ConnState {
    failed_at: Option<Instant>,
    closed: bool,
}

/// Redis 存储 - 懒建立一条共享连接
///
/// 首次建连在互斥锁内完成：并发的首批请求只会触发一次建连，其余请求等待结果。
/// 建好的连接放在单独的 `ready` 槽里，读取它从不等待建连锁，
/// 所以健康检查在建连期间立即返回 false。
/// 建连成功后由 `ConnectionManager` 负责断线重连。
pub struct RedisStore {
    client: redis::Client,
    ready: RwLock<Option<ConnectionManager>>,
    state: Mutex<ConnState>,
    policy: ConnectPolicy,
}

impl RedisStore {
    /// 只解析连接串，不发起连接
    pub fn new(url: &str, policy: ConnectPolicy) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("Redis 连接串无效: {}", e)))?;

        Ok(Self {
            client,
            ready: RwLock::new(None),
            state: Mutex::new(ConnState {
                failed_at: None,
                closed: false,
            }),
            policy,
        })
    }

    /// 已建立的连接（不等待建连锁）
    fn ready_connection(&self) -> Option<ConnectionManager> {
        self.ready
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_ready(&self, conn: Option<ConnectionManager>) -> Option<ConnectionManager> {
        let mut slot = self.ready.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, conn)
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        if let Some(conn) = self.ready_connection() {
            return Ok(conn);
        }

        let mut state = self.state.lock().await;

        if state.closed {
            return Err(StoreError::Unavailable("连接已关闭".to_string()));
        }

        // 等锁期间可能已经有别的请求建好了连接
        if let Some(conn) = self.ready_connection() {
            return Ok(conn);
        }

        if let Some(failed_at) = state.failed_at {
            if failed_at.elapsed() < RECONNECT_COOLDOWN {
                return Err(StoreError::Unavailable("Redis 建连冷却中".to_string()));
            }
        }

        match self.connect_with_backoff().await {
            Ok(conn) => {
                self.set_ready(Some(conn.clone()));
                state.failed_at = None;
                Ok(conn)
            }
            Err(e) => {
                state.failed_at = Some(Instant::now());
                Err(e)
            }
        }
    }

    async fn connect_with_backoff(&self) -> StoreResult<ConnectionManager> {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            tracing::info!("[Redis] 正在连接 (第 {} 次)", attempt);

            let result = tokio::time::timeout(
                self.policy.connect_timeout,
                ConnectionManager::new(self.client.clone()),
            )
            .await;

            match result {
                Ok(Ok(conn)) => {
                    tracing::info!("[Redis] 连接已建立");
                    return Ok(conn);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("连接超时 ({} ms)", self.policy.connect_timeout.as_millis())
                }
            }

            tracing::warn!("[Redis] 连接失败 (第 {} 次): {}", attempt, last_error);

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        tracing::error!("[Redis] 已达到最大重连次数 {}", self.policy.max_attempts);
        Err(StoreError::Connect {
            attempts: self.policy.max_attempts,
            reason: last_error,
        })
    }

    async fn run<T: redis::FromRedisValue>(&self, op: &'static str, cmd: redis::Cmd) -> StoreResult<T> {
        let mut conn = self.connection().await.inspect_err(|_| {
            METRICS.lockout_store_errors.with_label_values(&[op]).inc();
        })?;

        cmd.query_async(&mut conn).await.map_err(|e| {
            METRICS.lockout_store_errors.with_label_values(&[op]).inc();
            StoreError::from(e)
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("get", cmd).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl.as_secs().max(1));
        self.run("set", cmd).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await.inspect_err(|_| {
            METRICS.lockout_store_errors.with_label_values(&["incr"]).inc();
        })?;

        let result: redis::RedisResult<i64> =
            redis::cmd("INCR").arg(key).query_async(&mut conn).await;

        result.map_err(|e| {
            // 键里存的不是整数：交给上层修复，而不是当作存储故障
            if is_not_integer(&e) {
                return StoreError::InvalidValue {
                    key: key.to_string(),
                };
            }
            METRICS.lockout_store_errors.with_label_values(&["incr"]).inc();
            StoreError::from(e)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl.as_secs().max(1));
        let _: i64 = self.run("expire", cmd).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run("del", cmd).await?;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        // 只探测已有连接：不触发建连，也不等待正在进行的建连
        let Some(mut conn) = self.ready_connection() else {
            return false;
        };

        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        matches!(pong.as_deref(), Ok("PONG"))
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        if self.set_ready(None).is_some() {
            tracing::info!("[Redis] 连接已关闭");
        }
    }
}

fn is_not_integer(e: &redis::RedisError) -> bool {
    e.kind() == redis::ErrorKind::ResponseError && e.to_string().contains("not an integer")
}
