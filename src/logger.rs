use crate::config::LoggingConfig;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 保留的日志文件数量
const MAX_LOG_FILES: usize = 7;

/// 初始化日志系统
///
/// - 同时输出到控制台和文件（按天滚动）
/// - 后台任务定期清理超出数量的旧日志
/// - 指纹只会以截断前缀的形式出现在日志里
pub fn init_logger(config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.dir)?;

    // 东八区时间
    let offset = time::UtcOffset::from_hms(8, 0, 0)
        .map_err(|e| anyhow::anyhow!("时区偏移无效: {}", e))?;
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        offset,
        time::format_description::well_known::Rfc3339,
    );

    let file_appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "budget_guard=debug,tower_http=debug".into());

    // 文件输出层（不带颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_timer(timer.clone())
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("日志系统初始化失败: {}", e))?;

    tokio::spawn(log_cleanup_task(
        PathBuf::from(&config.dir),
        config.file_prefix.clone(),
    ));

    Ok(())
}

/// 后台任务：每小时清理一次旧日志
async fn log_cleanup_task(dir: PathBuf, prefix: String) {
    use tokio::time::{interval, Duration};

    let mut interval = interval(Duration::from_secs(3600));
    loop {
        interval.tick().await;
        if let Err(e) = prune_log_files(&dir, &prefix, MAX_LOG_FILES).await {
            eprintln!("日志文件清理失败: {}", e);
        }
    }
}

/// 按修改时间保留最新的 `keep` 个日志文件，返回删除的数量
async fn prune_log_files(dir: &Path, prefix: &str, keep: usize) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(prefix));
        if !matches {
            continue;
        }
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            files.push((path, modified));
        }
    }

    // 最新的在前
    files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in files.iter().skip(keep) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::info!("删除旧日志文件: {:?}", path);
                removed += 1;
            }
            Err(e) => eprintln!("删除旧日志文件失败 {:?}: {}", path, e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.dir, "logs");
        assert_eq!(config.file_prefix, "budget_guard");
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let dir = std::env::temp_dir().join(format!("budget_guard_logs_{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();

        for i in 0..4 {
            tokio::fs::write(dir.join(format!("app.2026-01-0{}", i + 1)), b"x")
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        tokio::fs::write(dir.join("other.log"), b"x").await.unwrap();

        let removed = prune_log_files(&dir, "app", 2).await.unwrap();
        assert_eq!(removed, 2);
        assert!(dir.join("app.2026-01-04").exists());
        assert!(dir.join("app.2026-01-03").exists());
        assert!(!dir.join("app.2026-01-01").exists());
        assert!(dir.join("other.log").exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
