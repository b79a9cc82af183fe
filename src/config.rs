use crate::guard::DelayRange;
use crate::lockout::{EscalationTable, LockoutPolicy, DEFAULT_BLOCK_DURATIONS};
use crate::store::ConnectPolicy;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lockout: LockoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<User>,
    pub jwt_secret: String,
    pub token_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            jwt_secret: String::new(),
            token_ttl_seconds: 86400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
}

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// 进程内存储，仅限单机开发
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 连接串；为空时整个限流子系统禁用（放行一切）
    pub url: Option<String>,
    pub backend: StoreBackend,
    pub connect_timeout_ms: u64,
    pub max_connect_attempts: u32,
    pub backoff_step_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            backend: StoreBackend::Redis,
            connect_timeout_ms: 15_000,
            max_connect_attempts: 10,
            backoff_step_ms: 100,
            backoff_cap_ms: 3_000,
        }
    }
}

impl StoreConfig {
    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_attempts: self.max_connect_attempts,
            backoff_step: Duration::from_millis(self.backoff_step_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    pub enabled: bool,
    pub namespace: String,
    pub max_attempts: u64,
    pub block_durations: Vec<u64>,
    pub attempts_ttl_seconds: u64,
    pub block_count_ttl_seconds: u64,
    /// 指纹盐，必须长期固定，轮换会清空所有客户端历史
    pub salt: String,
    pub accept_language_prefix: usize,
    pub accept_encoding_prefix: usize,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "ratelimit".to_string(),
            max_attempts: 5,
            block_durations: DEFAULT_BLOCK_DURATIONS.to_vec(),
            attempts_ttl_seconds: 3600,
            block_count_ttl_seconds: 86400 * 7,
            salt: String::new(),
            accept_language_prefix: 20,
            accept_encoding_prefix: 30,
            delay_min_ms: 100,
            delay_max_ms: 500,
        }
    }
}

impl LockoutConfig {
    pub fn policy(&self) -> Result<LockoutPolicy, String> {
        Ok(LockoutPolicy {
            namespace: self.namespace.clone(),
            max_attempts: self.max_attempts,
            escalation: EscalationTable::new(self.block_durations.clone())?,
            attempts_ttl: Duration::from_secs(self.attempts_ttl_seconds),
            block_count_ttl: Duration::from_secs(self.block_count_ttl_seconds),
        })
    }

    pub fn delay(&self) -> DelayRange {
        DelayRange {
            min_ms: self.delay_min_ms,
            max_ms: self.delay_max_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            file_prefix: "budget_guard".to_string(),
        }
    }
}

/// 严格解析布尔值，只接受 true/false/1/0，避免 "yes"、"off" 之类的歧义
pub fn parse_strict_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => anyhow::bail!("{} 的值 {:?} 无效，只接受 true/false/1/0", name, other),
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // 加载 .env 文件 (如果存在)
        let _ = dotenvy::dotenv();

        // 加载 config.toml（可选）
        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .build()?
            .try_deserialize()?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// 环境变量覆盖（优先级高于配置文件）
    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(url) = env::var("REDIS_URL") {
            self.store.url = Some(url);
        }
        if let Ok(salt) = env::var("RATE_LIMIT_SALT") {
            self.lockout.salt = salt;
        }
        if let Ok(secret) = env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(port) = env::var("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT 的值 {:?} 无效", port))?;
        }
        if let Ok(raw) = env::var("LOCKOUT_ENABLED") {
            self.lockout.enabled = parse_strict_bool("LOCKOUT_ENABLED", &raw)?;
        }

        // 空字符串等同于未配置
        if self.store.url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            self.store.url = None;
        }
        Ok(())
    }

    /// 启动时一次性校验，拒绝有歧义或不合法的配置
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("JWT_SECRET 未设置! 请在环境变量或 config.toml 中配置");
        }

        let lockout = &self.lockout;
        if lockout.max_attempts == 0 {
            anyhow::bail!("lockout.max_attempts 必须大于 0");
        }
        lockout.policy().map_err(|e| anyhow::anyhow!(e))?;
        if lockout.delay_min_ms > lockout.delay_max_ms {
            anyhow::bail!("lockout.delay_min_ms 不能大于 delay_max_ms");
        }
        if lockout.namespace.is_empty() || lockout.namespace.contains(':') {
            anyhow::bail!("lockout.namespace 不能为空且不能包含 ':'");
        }
        if self.lockout_active() && lockout.salt.is_empty() {
            anyhow::bail!("RATE_LIMIT_SALT 未设置! 启用限流时必须配置指纹盐");
        }
        Ok(())
    }

    /// 限流是否真正生效：开关打开，且配置了存储
    pub fn lockout_active(&self) -> bool {
        self.lockout.enabled
            && (self.store.url.is_some() || self.store.backend == StoreBackend::Memory)
    }
}
