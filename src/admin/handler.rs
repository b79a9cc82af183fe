use crate::{error::AppError, fingerprint::Fingerprint, lockout::LockoutStats, AppState};
use axum::{
    extract::{Path, State},
    Json,
};

/// 管理接口：查看某个 (端点, 指纹) 的锁定统计
/// 只能从 localhost 访问（由中间件控制），用于排查误封
pub async fn lockout_stats(
    State(state): State<AppState>,
    Path((endpoint, fingerprint)): Path<(String, String)>,
) -> Result<Json<LockoutStats>, AppError> {
    let fingerprint = Fingerprint::from_hex(&fingerprint)
        .ok_or_else(|| AppError::Validation("指纹格式错误".to_string()))?;

    let stats = state
        .engine
        .stats(&endpoint, &fingerprint)
        .await
        .ok_or_else(|| AppError::NotFound(format!("/admin/lockout/{}", endpoint)))?;

    Ok(Json(stats))
}
