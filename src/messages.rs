//! 远端消息生命周期：删除、批量清理、引用刷新与修复。

use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::{BackendError, FileDescriptor, RemoteBackend, validate_remote_id};
use crate::config::REPAIR_MAX_ITEMS;
use crate::error::ApiError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBatch {
    pub message_ids: Vec<i64>,
    pub error: &'static str,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub requested: usize,
    pub deleted: usize,
    pub failed_batches: Vec<FailedBatch>,
}

/// 转发得到的新副本及其主文件。
#[derive(Debug, Clone)]
pub struct RefreshedReference {
    pub file: FileDescriptor,
    pub copy_message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairItem {
    pub file_id: String,
    pub message_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub file_id: String,
    pub message_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fresh_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

fn coarse_code(err: &BackendError) -> &'static str {
    match err {
        BackendError::NotFound => "not_found",
        BackendError::RateLimited { .. } => "rate_limited",
        BackendError::Rejected(_) => "rejected",
        BackendError::TooLarge { .. } => "too_large",
        BackendError::Other(_) => "backend_error",
    }
}

pub struct MessageLifecycle {
    backend: Arc<dyn RemoteBackend>,
}

impl MessageLifecycle {
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self { backend }
    }

    /// 删除单条消息；已不存在视为成功。
    pub async fn delete(&self, message_id: i64) -> Result<(), BackendError> {
        match self.backend.delete_messages(&[message_id]).await {
            Ok(()) | Err(BackendError::NotFound) => {
                info!(message_id, "message deleted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// 按后端上限分批删除，单批失败不影响其余批次。
    pub async fn cleanup(&self, message_ids: &[i64]) -> CleanupReport {
        let mut seen = HashSet::new();
        let unique: Vec<i64> = message_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        let mut report = CleanupReport {
            requested: unique.len(),
            ..CleanupReport::default()
        };

        let batch_size = self.backend.delete_batch_limit().max(1);
        for batch in unique.chunks(batch_size) {
            match self.backend.delete_messages(batch).await {
                Ok(()) | Err(BackendError::NotFound) => report.deleted += batch.len(),
                Err(err) => {
                    warn!(count = batch.len(), error = %err, "cleanup batch failed");
                    report.failed_batches.push(FailedBatch {
                        message_ids: batch.to_vec(),
                        error: coarse_code(&err),
                    });
                }
            }
        }
        info!(
            requested = report.requested,
            deleted = report.deleted,
            failed_batches = report.failed_batches.len(),
            "message cleanup finished"
        );
        report
    }

    /// 转发原消息以取得新的文件引用；调用方负责丢弃副本。
    pub async fn refresh_reference(&self, message_id: i64) -> Result<RefreshedReference, BackendError> {
        let copy = self.backend.forward_message(message_id).await?;
        let file = copy
            .content
            .primary_file()
            .filter(|file| validate_remote_id(&file.remote_id).is_ok())
            .cloned();
        match file {
            Some(file) => Ok(RefreshedReference {
                file,
                copy_message_id: copy.message_id,
            }),
            None => {
                self.discard_copy(copy.message_id).await;
                Err(BackendError::Other("forwarded copy carries no usable file".into()))
            }
        }
    }

    pub async fn discard_copy(&self, message_id: i64) {
        if let Err(err) = self.delete(message_id).await {
            warn!(message_id, error = %err, "failed to discard forwarded copy");
        }
    }

    pub async fn repair(&self, items: &[RepairItem]) -> Vec<RepairOutcome> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let outcome = match self.refresh_reference(item.message_id).await {
                Ok(refreshed) => {
                    self.discard_copy(refreshed.copy_message_id).await;
                    RepairOutcome {
                        file_id: item.file_id.clone(),
                        message_id: item.message_id,
                        fresh_file_id: Some(refreshed.file.remote_id),
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(message_id = item.message_id, error = %err, "repair failed");
                    RepairOutcome {
                        file_id: item.file_id.clone(),
                        message_id: item.message_id,
                        fresh_file_id: None,
                        error: Some(coarse_code(&err)),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CleanupBody {
    message_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub(crate) struct RepairBody {
    items: Vec<RepairItem>,
}

#[derive(Serialize)]
pub(crate) struct RepairResponse {
    items: Vec<RepairOutcome>,
}

pub async fn delete_message(
    Path(message_id): Path<i64>,
    Extension(lifecycle): Extension<Arc<MessageLifecycle>>,
) -> Result<StatusCode, ApiError> {
    lifecycle.delete(message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cleanup_messages(
    Extension(lifecycle): Extension<Arc<MessageLifecycle>>,
    Json(body): Json<CleanupBody>,
) -> JsonResponse<CleanupReport> {
    JsonResponse(lifecycle.cleanup(&body.message_ids).await)
}

pub async fn repair_files(
    Extension(lifecycle): Extension<Arc<MessageLifecycle>>,
    Json(body): Json<RepairBody>,
) -> Result<JsonResponse<RepairResponse>, ApiError> {
    if body.items.len() > REPAIR_MAX_ITEMS {
        return Err(ApiError::BadRequest(format!(
            "at most {REPAIR_MAX_ITEMS} items per repair call"
        )));
    }
    let items = lifecycle.repair(&body.items).await;
    Ok(JsonResponse(RepairResponse { items }))
}
