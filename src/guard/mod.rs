//! 锁定守卫中间件
//!
//! 每个受保护端点一个守卫。放行时把 `GuardTicket` 放进请求扩展，
//! 业务处理器拿它去调用 `OutcomeReporter` 上报结果。

pub mod reporter;

pub use reporter::*;

use crate::error::AppError;
use crate::fingerprint::{Fingerprint, FingerprintDeriver, RequestAttributes};
use crate::lockout::{BlockStatus, LockoutEngine};
use crate::metrics::METRICS;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// 放行凭据：上报结果时用的 (端点, 指纹)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardTicket {
    pub endpoint: Arc<str>,
    pub fingerprint: Fingerprint,
}

/// 被拒绝时返回给客户端的内容，只有重试时间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throttled {
    pub retry_after: u64,
    pub message: String,
}

impl From<Throttled> for AppError {
    fn from(t: Throttled) -> Self {
        AppError::RateLimited {
            message: t.message,
            retry_after: t.retry_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// 存储被禁用时没有凭据
    Admitted(Option<GuardTicket>),
    Throttled(Throttled),
}

/// 拒绝前的随机延迟区间（毫秒），模糊“已封禁”和“正在校验凭证”两条路径的耗时差
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min_ms: 100,
            max_ms: 500,
        }
    }
}

impl DelayRange {
    pub fn pick(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

#[derive(Clone)]
pub struct LockoutGuard {
    endpoint: Arc<str>,
    engine: Arc<LockoutEngine>,
    deriver: Arc<FingerprintDeriver>,
    delay: DelayRange,
}

impl LockoutGuard {
    pub fn new(
        endpoint: &str,
        engine: Arc<LockoutEngine>,
        deriver: Arc<FingerprintDeriver>,
        delay: DelayRange,
    ) -> Self {
        Self {
            endpoint: Arc::from(endpoint),
            engine,
            deriver,
            delay,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 判定是否放行
    pub async fn admit(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Admission {
        // 未配置存储：完全放行，不计算指纹也不访问存储
        if !self.engine.is_enabled() {
            METRICS.lockout_checks.with_label_values(&["disabled"]).inc();
            return Admission::Admitted(None);
        }

        let attrs = RequestAttributes::from_request(headers, peer);
        let fingerprint = self.deriver.derive(&attrs);

        match self.engine.check_blocked(&self.endpoint, &fingerprint).await {
            BlockStatus::Open => Admission::Admitted(Some(GuardTicket {
                endpoint: self.endpoint.clone(),
                fingerprint,
            })),
            BlockStatus::Blocked { remaining_secs } => {
                tokio::time::sleep(self.delay.pick()).await;

                tracing::info!(
                    "[Lockout] 拒绝已封禁客户端: {} (端点 {}，剩余 {} 秒)",
                    fingerprint,
                    self.endpoint,
                    remaining_secs
                );

                Admission::Throttled(Throttled {
                    retry_after: remaining_secs,
                    message: retry_message(remaining_secs),
                })
            }
        }
    }
}

/// axum 中间件：`middleware::from_fn_with_state(guard, lockout_middleware)`
pub async fn lockout_middleware(
    State(guard): State<LockoutGuard>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    match guard.admit(request.headers(), peer).await {
        Admission::Admitted(ticket) => {
            if let Some(ticket) = ticket {
                request.extensions_mut().insert(ticket);
            }
            next.run(request).await
        }
        Admission::Throttled(throttled) => AppError::from(throttled).into_response(),
    }
}

/// 给人看的重试时间：≥1 小时按小时，≥1 分钟按分钟，否则按秒，均向上取整
pub fn retry_message(remaining_secs: u64) -> String {
    let estimate = if remaining_secs >= 3600 {
        format!("{} 小时", remaining_secs.div_ceil(3600))
    } else if remaining_secs >= 60 {
        format!("{} 分钟", remaining_secs.div_ceil(60))
    } else {
        format!("{} 秒", remaining_secs)
    };
    format!("尝试次数过多，请在 {}后重试。", estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lockout::LockoutPolicy;
    use crate::store::{KvBackend, MemoryStore};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request as HttpRequest, StatusCode},
        middleware,
        routing::post,
        Extension, Router,
    };
    use tower::ServiceExt;

    const NO_DELAY: DelayRange = DelayRange { min_ms: 0, max_ms: 0 };

    fn guard_with(backend: KvBackend) -> LockoutGuard {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let engine = Arc::new(LockoutEngine::new(backend, LockoutPolicy::default(), clock));
        let deriver = Arc::new(FingerprintDeriver::new("salt".to_string(), 20, 30));
        LockoutGuard::new("login", engine, deriver, NO_DELAY)
    }

    fn memory_guard() -> LockoutGuard {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        guard_with(KvBackend::new(Arc::new(MemoryStore::new(clock))))
    }

    fn headers(ip: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-real-ip", ip.parse().unwrap());
        h
    }

    #[test]
    fn test_retry_message_granularity() {
        assert_eq!(retry_message(1), "尝试次数过多，请在 1 秒后重试。");
        assert_eq!(retry_message(59), "尝试次数过多，请在 59 秒后重试。");
        assert_eq!(retry_message(60), "尝试次数过多，请在 1 分钟后重试。");
        assert_eq!(retry_message(61), "尝试次数过多，请在 2 分钟后重试。");
        assert_eq!(retry_message(3599), "尝试次数过多，请在 60 分钟后重试。");
        assert_eq!(retry_message(3600), "尝试次数过多，请在 1 小时后重试。");
        assert_eq!(retry_message(86400), "尝试次数过多，请在 24 小时后重试。");
    }

    #[test]
    fn test_delay_range_pick() {
        let range = DelayRange { min_ms: 100, max_ms: 500 };
        for _ in 0..100 {
            let d = range.pick();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(500));
        }
        assert_eq!(NO_DELAY.pick(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_disabled_backend_admits_without_ticket() {
        let guard = guard_with(KvBackend::disabled());
        let reporter = OutcomeReporter::new(guard.engine.clone());
        let disabled_checks = METRICS.lockout_checks.with_label_values(&["disabled"]);
        let before = disabled_checks.get();

        for _ in 0..10 {
            let admission = guard.admit(&headers("1.1.1.1"), None).await;
            assert_eq!(admission, Admission::Admitted(None));
            reporter.report_failure(None).await;
        }

        // 其他测试可能并发累加同一个全局计数器
        assert!(disabled_checks.get() >= before + 10.0);
    }

    #[tokio::test]
    async fn test_admit_then_throttle() {
        let guard = memory_guard();
        let reporter = OutcomeReporter::new(guard.engine.clone());

        for _ in 0..5 {
            let Admission::Admitted(ticket) = guard.admit(&headers("2.2.2.2"), None).await else {
                panic!("封禁前应该放行");
            };
            let ticket = ticket.expect("启用存储时应有凭据");
            assert_eq!(&*ticket.endpoint, "login");
            reporter.report_failure(Some(&ticket)).await;
        }

        match guard.admit(&headers("2.2.2.2"), None).await {
            Admission::Throttled(t) => {
                assert_eq!(t.retry_after, 60);
                assert_eq!(t.message, "尝试次数过多，请在 1 分钟后重试。");
            }
            other => panic!("应该被拒绝: {:?}", other),
        }

        // 其他客户端不受影响
        assert!(matches!(
            guard.admit(&headers("3.3.3.3"), None).await,
            Admission::Admitted(Some(_))
        ));
    }

    async fn echo_ticket(ticket: Option<Extension<GuardTicket>>) -> String {
        match ticket {
            Some(Extension(t)) => t.fingerprint.as_str().to_string(),
            None => "none".to_string(),
        }
    }

    fn app(guard: LockoutGuard) -> Router {
        Router::new()
            .route("/login", post(echo_ticket))
            .layer(middleware::from_fn_with_state(guard, lockout_middleware))
    }

    fn login_request() -> HttpRequest<Body> {
        HttpRequest::post("/login")
            .header("x-forwarded-for", "9.9.9.9")
            .header("user-agent", "test-agent")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_middleware_attaches_ticket() {
        let guard = memory_guard();
        let response = app(guard).oneshot(login_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 64);
    }

    #[tokio::test]
    async fn test_middleware_passes_through_when_disabled() {
        let guard = guard_with(KvBackend::disabled());
        let response = app(guard).oneshot(login_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"none");
    }

    #[tokio::test]
    async fn test_middleware_rejects_blocked_client() {
        let guard = memory_guard();
        let reporter = OutcomeReporter::new(guard.engine.clone());

        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", "9.9.9.9".parse().unwrap());
        h.insert("user-agent", "test-agent".parse().unwrap());
        let Admission::Admitted(Some(ticket)) = guard.admit(&h, None).await else {
            panic!("应该放行");
        };
        for _ in 0..5 {
            reporter.report_failure(Some(&ticket)).await;
        }

        let response = app(guard).oneshot(login_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "RATE_LIMITED");
        assert_eq!(value["retryAfter"], 60);
        // 不泄露指纹
        assert!(!String::from_utf8_lossy(&body).contains(ticket.fingerprint.as_str()));
    }
}
