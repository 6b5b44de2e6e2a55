//! 上传会话清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::SESSION_PRUNE_INTERVAL_SECS;
use crate::upload::UploadRegistry;

/// 启动后台任务（过期上传会话清理）。
pub fn spawn_background_tasks(registry: Arc<UploadRegistry>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let pruned = registry.sessions.prune_expired().await;
            if pruned > 0 {
                let live = registry.sessions.len().await;
                debug!(pruned, live, "pruned expired upload sessions");
            }
        }
    });
}
