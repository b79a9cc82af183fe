use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    /// 锁定检查结果（open / blocked / disabled）
    pub lockout_checks: CounterVec,
    /// 按第几次封禁分组（1..4, 5+）
    pub lockout_blocks: CounterVec,
    /// 存储调用失败，按操作分组
    pub lockout_store_errors: CounterVec,
    pub login_attempts: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let lockout_checks = CounterVec::new(
            prometheus::Opts::new("lockout_checks_total", "Lockout checks grouped by result"),
            &["result"],
        ).unwrap();
        registry.register(Box::new(lockout_checks.clone())).unwrap();

        let lockout_blocks = CounterVec::new(
            prometheus::Opts::new("lockout_blocks_total", "Blocks applied grouped by offense number"),
            &["offense"],
        ).unwrap();
        registry.register(Box::new(lockout_blocks.clone())).unwrap();

        let lockout_store_errors = CounterVec::new(
            prometheus::Opts::new("lockout_store_errors_total", "Key-value store failures grouped by operation"),
            &["op"],
        ).unwrap();
        registry.register(Box::new(lockout_store_errors.clone())).unwrap();

        let login_attempts = CounterVec::new(
            prometheus::Opts::new("login_attempts_total", "Login attempts grouped by result"),
            &["result"],
        ).unwrap();
        registry.register(Box::new(login_attempts.clone())).unwrap();

        Self {
            registry,
            lockout_checks,
            lockout_blocks,
            lockout_store_errors,
            login_attempts,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }

    /// 第 n 次封禁的标签，5 次及以上合并
    pub fn offense_label(block_count: u64) -> &'static str {
        match block_count {
            0 | 1 => "1",
            2 => "2",
            3 => "3",
            4 => "4",
            _ => "5+",
        }
    }
}

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);
