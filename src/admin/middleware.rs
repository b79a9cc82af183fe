use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

/// 中间件：只允许 localhost 访问
///
/// 只看套接字地址，不信任任何代理头；拿不到连接信息时一律拒绝。
pub async fn localhost_only(request: Request, next: Next) -> Result<Response, Response> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    match peer {
        Some(addr) if addr.ip().is_loopback() => {
            tracing::debug!("允许来自 localhost 的管理请求: {}", addr);
            Ok(next.run(request).await)
        }
        other => {
            tracing::warn!("拒绝非 localhost 的管理请求，来源: {:?}", other);
            Err((
                StatusCode::FORBIDDEN,
                "Admin API only accessible from localhost",
            )
                .into_response())
        }
    }
}
