pub mod admin;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod lockout;
pub mod logger;
pub mod metrics;
pub mod store;

use auth::JwtService;
use axum::{
    extract::State,
    http::Uri,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use config::Config;
use guard::{LockoutGuard, OutcomeReporter};
use lockout::LockoutEngine;
use serde_json::json;
use std::sync::Arc;
use store::KvBackend;
use tower_http::trace::TraceLayer;

// 统一的应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt_service: Arc<JwtService>,
    pub backend: KvBackend,
    pub engine: Arc<LockoutEngine>,
    pub login_guard: LockoutGuard,
    pub reporter: OutcomeReporter,
}

/// 构建完整路由（main 与测试共用）
pub fn router(state: AppState) -> Router {
    // 公开路由
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(render_metrics));

    // 受保护的登录接口：先过锁定守卫，再做凭证校验
    let login_routes = Router::new()
        .route("/api/auth/login", post(auth::login))
        .layer(middleware::from_fn_with_state(
            state.login_guard.clone(),
            guard::lockout_middleware,
        ));

    // 管理路由（只允许 localhost 访问）
    let admin_routes = Router::new()
        .route(
            "/admin/lockout/:endpoint/:fingerprint",
            get(admin::lockout_stats),
        )
        .layer(middleware::from_fn(admin::localhost_only));

    public_routes
        .merge(login_routes)
        .merge(admin_routes)
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.backend.health().await;
    Json(json!({
        "ok": true,
        "service": "budget_guard",
        "time": chrono::Utc::now().to_rfc3339(),
        "store": store.as_str(),
    }))
}

async fn render_metrics() -> Result<String, error::AppError> {
    metrics::METRICS
        .render()
        .map_err(|e| error::AppError::internal_with_context("metrics 渲染失败", &e))
}

async fn not_found(uri: Uri) -> error::AppError {
    error::AppError::NotFound(uri.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::User;
    use crate::fingerprint::{FingerprintDeriver, RequestAttributes};
    use crate::guard::DelayRange;
    use crate::lockout::LockoutPolicy;
    use crate::store::MemoryStore;
    use axum::{
        body::{to_bytes, Body},
        extract::ConnectInfo,
        http::{header, HeaderMap, Request, StatusCode},
    };
    use std::net::SocketAddr;
    use tower::ServiceExt;

    const SALT: &str = "test-salt";

    fn test_state(backend_enabled: bool) -> AppState {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000_000));
        let backend = if backend_enabled {
            KvBackend::new(Arc::new(MemoryStore::new(clock.clone())))
        } else {
            KvBackend::disabled()
        };

        let mut config = Config::default();
        config.auth.jwt_secret = "secret".to_string();
        config.auth.users = vec![User {
            username: "alice".to_string(),
            email: Some("alice@example.com".to_string()),
            password: "correct-horse".to_string(),
        }];

        let engine = Arc::new(LockoutEngine::new(
            backend.clone(),
            LockoutPolicy::default(),
            clock,
        ));
        let deriver = Arc::new(FingerprintDeriver::new(SALT.to_string(), 20, 30));
        let no_delay = DelayRange { min_ms: 0, max_ms: 0 };

        AppState {
            config: Arc::new(config),
            jwt_service: Arc::new(JwtService::new("secret".to_string(), 3600).unwrap()),
            backend,
            login_guard: LockoutGuard::new("login", engine.clone(), deriver, no_delay),
            reporter: OutcomeReporter::new(engine.clone()),
            engine,
        }
    }

    fn login_request(identifier: &str, password: &str) -> Request<Body> {
        let body = json!({ "username": identifier, "password": password });
        Request::post("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_store() {
        let app = router(test_state(true));
        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["store"], "up");

        let app = router(test_state(false));
        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await["store"], "disabled");
    }

    #[tokio::test]
    async fn test_login_success_returns_token() {
        let app = router(test_state(true));
        let response = app
            .oneshot(login_request("alice", "correct-horse"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let value = json_body(response).await;
        assert_eq!(value["ok"], true);
        assert!(!value["token"].as_str().unwrap().is_empty());
        assert_eq!(value["expires_in"], 3600);
    }

    #[tokio::test]
    async fn test_login_by_email() {
        let app = router(test_state(true));
        let response = app
            .oneshot(login_request("alice@example.com", "correct-horse"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_missing_fields() {
        let app = router(test_state(true));
        let response = app.oneshot(login_request("alice", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_fifth_failure_blocks_even_correct_password() {
        let app = router(test_state(true));

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(login_request("alice", "wrong"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app
            .oneshot(login_request("alice", "correct-horse"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        let value = json_body(response).await;
        assert_eq!(value["error"], "RATE_LIMITED");
        assert_eq!(value["retryAfter"], 60);
        assert_eq!(value["message"], "尝试次数过多，请在 1 分钟后重试。");
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_the_same() {
        let app = router(test_state(true));

        let unknown = app
            .clone()
            .oneshot(login_request("mallory", "whatever"))
            .await
            .unwrap();
        let wrong = app.oneshot(login_request("alice", "wrong")).await.unwrap();

        assert_eq!(unknown.status(), wrong.status());
        assert_eq!(json_body(unknown).await, json_body(wrong).await);
    }

    #[tokio::test]
    async fn test_disabled_store_never_blocks() {
        let app = router(test_state(false));

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(login_request("alice", "wrong"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app
            .oneshot(login_request("alice", "correct-horse"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_stats_localhost_only() {
        let state = test_state(true);
        let app = router(state.clone());

        for _ in 0..2 {
            app.clone()
                .oneshot(login_request("alice", "wrong"))
                .await
                .unwrap();
        }

        // 登录请求没有连接信息也没有代理头，指纹按这些属性计算
        let attrs = RequestAttributes::from_request(&HeaderMap::new(), None);
        let fingerprint = FingerprintDeriver::new(SALT.to_string(), 20, 30).derive(&attrs);
        let uri = format!("/admin/lockout/login/{}", fingerprint.as_str());

        let mut request = Request::get(&uri).body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50000))));
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let value = json_body(response).await;
        assert_eq!(value["attempts"], 2);
        assert_eq!(value["block_count"], 0);
        assert!(value["blocked_until"].is_null());

        let mut request = Request::get(&uri).body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 50000))));
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // 没有连接信息也拒绝
        let response = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_rejects_malformed_fingerprint() {
        let app = router(test_state(true));
        let mut request = Request::get("/admin/lockout/login/not-hex")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50000))));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_not_found() {
        let app = router(test_state(true));
        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = json_body(response).await;
        assert_eq!(value["error"], "NOT_FOUND");
        assert_eq!(value["path"], "/nope");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = router(test_state(true));
        app.clone()
            .oneshot(login_request("alice", "wrong"))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("login_attempts_total"));
    }
}
