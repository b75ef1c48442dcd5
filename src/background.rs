//! 缓存清扫与上传会话回收的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::FileCache;
use crate::config::UPLOAD_REAP_INTERVAL_SECS;
use crate::upload::UploadSessions;

/// 启动后台任务（缓存清扫与过期上传回收）。
pub fn spawn_background_tasks(
    cache: Arc<FileCache>,
    sessions: Arc<UploadSessions>,
    sweep_interval: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            let report = cache.sweep().await;
            debug!(evicted = report.total(), "cache sweep tick");
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_REAP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let report = sessions.reap_expired().await;
            debug!(
                sessions = report.sessions,
                orphans = report.orphans,
                "upload reap tick"
            );
        }
    });
}
