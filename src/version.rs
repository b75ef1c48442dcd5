//! 版本信息与运行状态处理器。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;

use crate::cache::{CacheStats, FileCache};
use crate::error::ApiError;
use crate::sender::MediaSender;
use crate::upload::UploadSessions;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
    build_env: String,
}

/// 返回当前版本信息。
pub async fn get_version_info() -> Result<JsonResponse<VersionInfo>, ApiError> {
    let version_info = VersionInfo {
        version: crate::build::PKG_VERSION,
        commit: crate::build::SHORT_COMMIT,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
    };
    Ok(JsonResponse(version_info))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStats {
    limit: usize,
    active: usize,
    waiting: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    status: &'static str,
    backend: &'static str,
    send_gate: GateStats,
    upload_sessions: usize,
    cache: CacheStats,
}

/// 发送闸门、上传会话与缓存的即时计数。
pub async fn get_health(
    Extension(sender): Extension<Arc<MediaSender>>,
    Extension(sessions): Extension<Arc<UploadSessions>>,
    Extension(cache): Extension<Arc<FileCache>>,
) -> JsonResponse<HealthReport> {
    let gate = sender.gate();
    JsonResponse(HealthReport {
        status: "ok",
        backend: sender.backend_name(),
        send_gate: GateStats {
            limit: gate.limit(),
            active: gate.active(),
            waiting: gate.waiting(),
        },
        upload_sessions: sessions.active_count().await,
        cache: cache.stats().await,
    })
}
