use crate::{error::AppError, guard::GuardTicket, metrics::METRICS, AppState};
use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 用户不存在时也做一次同样耗时的比较
const ABSENT_USER_PASSWORD: &str = "absent-user-placeholder";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub ok: bool,
    pub token: String,
    pub expires_in: u64,
}

/// 登录接口（挂在锁定守卫之后）
///
/// 每次凭证校验失败上报一次失败，成功上报一次成功；
/// 用户不存在和密码错误返回同样的响应。
pub async fn login(
    State(state): State<AppState>,
    ticket: Option<Extension<GuardTicket>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let ticket = ticket.map(|Extension(t)| t);

    let identifier = req
        .email
        .as_deref()
        .or(req.username.as_deref())
        .unwrap_or("")
        .trim();
    let password = req.password.as_deref().unwrap_or("");

    if identifier.is_empty() || password.is_empty() {
        return Err(AppError::Validation("请输入用户名（或邮箱）和密码。".to_string()));
    }

    // 含 @ 按邮箱查找，否则按用户名
    let looks_like_email = identifier.contains('@');
    let user = state.config.auth.users.iter().find(|u| {
        if looks_like_email {
            u.email.as_deref() == Some(identifier)
        } else {
            u.username == identifier
        }
    });

    let matched = password_matches(
        user.map_or(ABSENT_USER_PASSWORD, |u| u.password.as_str()),
        password,
    );

    let Some(user) = user.filter(|_| matched) else {
        METRICS.login_attempts.with_label_values(&["failure"]).inc();
        if let Some(outcome) = state.reporter.report_failure(ticket.as_ref()).await {
            if outcome.blocked {
                METRICS.login_attempts.with_label_values(&["blocked"]).inc();
            }
        }
        return Err(AppError::InvalidCredentials);
    };

    state.reporter.report_success(ticket.as_ref()).await;
    METRICS.login_attempts.with_label_values(&["success"]).inc();

    let token = state
        .jwt_service
        .generate_token(&user.username)
        .map_err(|e| AppError::internal_with_context("Token 生成失败", &e))?;

    tracing::info!("用户 {} 登录成功", user.username);

    Ok(Json(LoginResponse {
        ok: true,
        token,
        expires_in: state.jwt_service.ttl_seconds(),
    }))
}

/// 常量时间比较密码：先哈希成定长摘要，耗时与密码内容和长度无关
fn password_matches(stored: &str, supplied: &str) -> bool {
    let stored = Sha256::digest(stored.as_bytes());
    let supplied = Sha256::digest(supplied.as_bytes());
    stored.as_slice().ct_eq(supplied.as_slice()).into()
}
