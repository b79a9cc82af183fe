use std::time::Duration;

/// 默认递进封禁时长（秒）：1 分钟、5 分钟、15 分钟、1 小时，第 5 次起 24 小时
pub const DEFAULT_BLOCK_DURATIONS: [u64; 5] = [60, 300, 900, 3600, 86400];

pub const DEFAULT_MAX_ATTEMPTS: u64 = 5;
/// 失败计数的闲置过期时间
pub const DEFAULT_ATTEMPTS_TTL: Duration = Duration::from_secs(3600);
/// 封禁次数的保留期
pub const DEFAULT_BLOCK_COUNT_TTL: Duration = Duration::from_secs(86400 * 7);
pub const DEFAULT_NAMESPACE: &str = "ratelimit";

/// 递进封禁表，按历史封禁次数取值，超出长度取最后一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationTable(Vec<u64>);

impl EscalationTable {
    pub fn new(durations: Vec<u64>) -> Result<Self, String> {
        if durations.is_empty() {
            return Err("封禁时长表不能为空".to_string());
        }
        if durations.iter().any(|d| *d == 0) {
            return Err("封禁时长必须大于 0".to_string());
        }
        Ok(Self(durations))
    }

    /// 下标为 `min(block_count, len - 1)`，不会越界
    pub fn duration_for(&self, block_count: u64) -> u64 {
        let last = self.0.len() - 1;
        let index = usize::try_from(block_count).map_or(last, |n| n.min(last));
        self.0[index]
    }

    pub fn durations(&self) -> &[u64] {
        &self.0
    }
}

impl Default for EscalationTable {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_DURATIONS.to_vec())
    }
}

/// 锁定策略（全局共享，各端点用独立的键空间）
#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    pub namespace: String,
    pub max_attempts: u64,
    pub escalation: EscalationTable,
    pub attempts_ttl: Duration,
    pub block_count_ttl: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            escalation: EscalationTable::default(),
            attempts_ttl: DEFAULT_ATTEMPTS_TTL,
            block_count_ttl: DEFAULT_BLOCK_COUNT_TTL,
        }
    }
}
