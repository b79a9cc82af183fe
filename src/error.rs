use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// 键值存储错误
///
/// 只在适配层与状态机之间流动，绝不会透传给客户端。
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("存储不可用: {0}")]
    Unavailable(String),

    #[error("存储连接失败（已尝试 {attempts} 次）: {reason}")]
    Connect { attempts: u32, reason: String },

    #[error("存储值格式错误: {key}")]
    InvalidValue { key: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("请求参数错误: {0}")]
    Validation(String),

    /// 用户不存在和密码错误统一返回这一种
    #[error("凭证无效")]
    InvalidCredentials,

    #[error("请求过于频繁")]
    RateLimited { message: String, retry_after: u64 },

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("内部错误: {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            AppError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                "凭证无效。".to_string(),
            ),
            AppError::RateLimited {
                message,
                retry_after,
            } => {
                let body = Json(json!({
                    "ok": false,
                    "error": "RATE_LIMITED",
                    "message": message,
                    "retryAfter": retry_after,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                return response;
            }
            AppError::NotFound(path) => {
                let body = Json(json!({
                    "ok": false,
                    "error": "NOT_FOUND",
                    "path": path,
                }));
                return (StatusCode::NOT_FOUND, body).into_response();
            }
            AppError::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = Json(json!({
            "ok": false,
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

impl AppError {
    /// 创建带上下文的内部错误
    ///
    /// 使用示例：
    /// ```
    /// # use budget_guard::error::AppError;
    /// # let err = "boom";
    /// AppError::internal_with_context("Token 生成失败", &err);
    /// ```
    pub fn internal_with_context(context: &str, err: &dyn std::fmt::Display) -> Self {
        tracing::error!(
            context = context,
            error = %err,
            "内部错误发生"
        );
        AppError::InternalError(format!("{}: {}", context, err))
    }
}
