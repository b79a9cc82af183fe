use budget_guard::{
    auth::JwtService,
    clock::{Clock, SystemClock},
    config::{Config, StoreBackend},
    fingerprint::FingerprintDeriver,
    guard::{LockoutGuard, OutcomeReporter},
    lockout::LockoutEngine,
    logger,
    store::{KvBackend, MemoryStore, RedisStore},
    AppState,
};
use std::sync::Arc;

/// 受保护的登录端点标识（同时是存储键的一部分）
const LOGIN_ENDPOINT: &str = "login";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    let config = Config::load()?;

    logger::init_logger(&config.logging)?;
    tracing::info!("配置加载成功");
    tracing::info!("服务器地址: {}:{}", config.server.host, config.server.port);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = build_backend(&config, clock.clone())?;

    let policy = config
        .lockout
        .policy()
        .map_err(|e| anyhow::anyhow!("锁定策略无效: {}", e))?;
    tracing::info!(
        "锁定: {} 次失败封禁，递进时长 {:?} 秒",
        policy.max_attempts,
        policy.escalation.durations()
    );

    let engine = Arc::new(LockoutEngine::new(backend.clone(), policy, clock));
    let deriver = Arc::new(FingerprintDeriver::new(
        config.lockout.salt.clone(),
        config.lockout.accept_language_prefix,
        config.lockout.accept_encoding_prefix,
    ));
    let login_guard = LockoutGuard::new(
        LOGIN_ENDPOINT,
        engine.clone(),
        deriver,
        config.lockout.delay(),
    );

    let jwt_service = Arc::new(
        JwtService::new(config.auth.jwt_secret.clone(), config.auth.token_ttl_seconds)
            .map_err(|e| anyhow::anyhow!("JWT服务初始化失败: {}", e))?,
    );

    let config = Arc::new(config);

    let app_state = AppState {
        config: config.clone(),
        jwt_service,
        backend: backend.clone(),
        reporter: OutcomeReporter::new(engine.clone()),
        engine,
        login_guard,
    };

    let app = budget_guard::router(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🚀 服务启动成功: http://{}", addr);
    tracing::info!("📝 登录接口: POST http://{}/api/auth/login", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(backend))
    .await?;

    Ok(())
}

/// 根据配置选择存储后端；没有连接串时禁用限流（放行一切）
fn build_backend(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<KvBackend> {
    if !config.lockout_active() {
        tracing::warn!("未配置键值存储或限流已关闭，登录限流禁用");
        return Ok(KvBackend::disabled());
    }

    match (config.store.backend, config.store.url.as_deref()) {
        (StoreBackend::Memory, _) => {
            tracing::warn!("使用进程内存储，仅适用于单机开发");
            Ok(KvBackend::new(Arc::new(MemoryStore::new(clock))))
        }
        (StoreBackend::Redis, Some(url)) => {
            let store = RedisStore::new(url, config.store.connect_policy())
                .map_err(|e| anyhow::anyhow!("Redis 初始化失败: {}", e))?;
            tracing::info!("登录限流已启用 (Redis，首次请求时建立连接)");
            Ok(KvBackend::new(Arc::new(store)))
        }
        (StoreBackend::Redis, None) => Ok(KvBackend::disabled()),
    }
}

/// 优雅关闭信号处理
async fn shutdown_signal(backend: KvBackend) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("无法监听 Ctrl+C 信号: {}", e);
        return;
    }

    tracing::info!("正在关闭存储连接...");
    backend.close().await;
}
