//! 文件发送：选择媒体形态、经并发闸门提交，并以双重超时等待后端完成。

use serde::Serialize;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::backend::{
    BackendError, MediaKind, OutgoingMedia, RemoteBackend, RemoteMessage, SendEvent,
    validate_remote_id,
};
use crate::gate::SendGate;

#[derive(Debug, Clone)]
pub struct SendPolicy {
    pub photo_max_bytes: u64,
    pub idle_timeout: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// 按文件大小推算硬超时时假定的每秒字节数。
    pub min_throughput: u64,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send did not complete within {0:?}")]
    HardTimeout(Duration),
    #[error("send stalled: no progress for {0:?}")]
    Stalled(Duration),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend returned an unusable file identifier: {0}")]
    InvalidIdentifier(String),
    #[error("delivered message carries no file")]
    MissingFile,
    #[error("backend event stream closed before completion")]
    ChannelClosed,
    #[error("send gate closed")]
    GateClosed,
}

/// 发送成功后返回给调用方的标识集合。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub remote_id: String,
    pub backend_internal_id: Option<i64>,
    pub source_message_id: i64,
    pub kind: MediaKind,
    pub size: u64,
    pub thumbnail: Option<ThumbnailRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailRef {
    pub remote_id: String,
    pub width: u32,
    pub height: u32,
    pub size: Option<u64>,
}

/// 按 MIME 与大小选择消息形态。
pub fn classify_media(mime_type: &str, size: u64, photo_max_bytes: u64) -> MediaKind {
    let mime = mime_type.trim().to_ascii_lowercase();
    match mime.as_str() {
        "image/jpeg" | "image/jpg" | "image/png" | "image/webp" if size <= photo_max_bytes => {
            MediaKind::Photo
        }
        m if m.starts_with("video/") => MediaKind::Video,
        m if m.starts_with("audio/") => MediaKind::Audio,
        _ => MediaKind::Document,
    }
}

/// 硬超时随文件大小线性增长，并夹在上下限之间。
pub fn completion_timeout(policy: &SendPolicy, size: u64) -> Duration {
    let throughput = policy.min_throughput.max(1);
    let scaled = Duration::from_secs(size.div_ceil(throughput));
    scaled.clamp(policy.min_timeout, policy.max_timeout.max(policy.min_timeout))
}

/// 空闲计时器，每次进度事件都会将其推后。
struct IdleWatchdog {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleWatchdog {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.timeout);
    }

    async fn expired(&mut self) {
        self.sleep.as_mut().await;
    }
}

/// 等待后端完成发送，同时受绝对截止时间与可重置的空闲计时器约束。
async fn await_delivery(
    events: &mut mpsc::UnboundedReceiver<SendEvent>,
    hard_timeout: Duration,
    idle_timeout: Duration,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> Result<RemoteMessage, SendError> {
    let deadline = tokio::time::sleep(hard_timeout);
    tokio::pin!(deadline);
    let mut watchdog = IdleWatchdog::new(idle_timeout);

    loop {
        tokio::select! {
            _ = &mut deadline => return Err(SendError::HardTimeout(hard_timeout)),
            _ = watchdog.expired() => return Err(SendError::Stalled(idle_timeout)),
            event = events.recv() => match event {
                Some(SendEvent::Progress { sent, total }) => {
                    watchdog.reset();
                    if total > 0 {
                        on_progress((sent as f64 / total as f64).clamp(0.0, 1.0));
                    }
                }
                Some(SendEvent::Delivered(message)) => return Ok(message),
                Some(SendEvent::Failed(err)) => return Err(SendError::Backend(err)),
                None => return Err(SendError::ChannelClosed),
            },
        }
    }
}

fn is_internal_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// 从后端消息中取出主文件与缩略图描述。
fn extract_stored_file(
    message: &RemoteMessage,
    kind: MediaKind,
    fallback_size: u64,
) -> Result<StoredFile, SendError> {
    let file = message
        .content
        .primary_file()
        .ok_or(SendError::MissingFile)?;
    if is_internal_id(&file.remote_id) {
        return Err(SendError::InvalidIdentifier(file.remote_id.clone()));
    }
    validate_remote_id(&file.remote_id)
        .map_err(|_| SendError::InvalidIdentifier(file.remote_id.clone()))?;

    let thumbnail = message.content.thumbnail().and_then(|thumb| {
        if validate_remote_id(&thumb.file.remote_id).is_err() {
            warn!(thumbnail_id = thumb.file.remote_id, "dropping unusable thumbnail id");
            return None;
        }
        Some(ThumbnailRef {
            remote_id: thumb.file.remote_id.clone(),
            width: thumb.width,
            height: thumb.height,
            size: thumb.file.size,
        })
    });

    Ok(StoredFile {
        remote_id: file.remote_id.clone(),
        backend_internal_id: file.internal_id,
        source_message_id: message.message_id,
        kind,
        size: file.size.unwrap_or(fallback_size),
        thumbnail,
    })
}

/// 单次上传与分片上传共用的发送路径。
pub struct MediaSender {
    backend: Arc<dyn RemoteBackend>,
    gate: SendGate,
    policy: SendPolicy,
}

impl MediaSender {
    pub fn new(backend: Arc<dyn RemoteBackend>, gate: SendGate, policy: SendPolicy) -> Self {
        Self {
            backend,
            gate,
            policy,
        }
    }

    pub fn gate(&self) -> &SendGate {
        &self.gate
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn send(
        &self,
        path: &Path,
        file_name: &str,
        mime_type: &str,
        size: u64,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<StoredFile, SendError> {
        let mut kind = classify_media(mime_type, size, self.policy.photo_max_bytes);
        let hard_timeout = completion_timeout(&self.policy, size);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SendError::GateClosed)?;

        loop {
            let media = OutgoingMedia {
                kind,
                path: path.to_path_buf(),
                file_name: file_name.to_string(),
                mime_type: mime_type.to_string(),
                size,
            };
            debug!(file_name, kind = kind.as_str(), size, ?hard_timeout, "sending to backend");
            let result = match self.backend.send_media(media).await {
                Ok(mut pending) => {
                    await_delivery(
                        &mut pending.events,
                        hard_timeout,
                        self.policy.idle_timeout,
                        on_progress,
                    )
                    .await
                }
                Err(err) => Err(SendError::Backend(err)),
            };

            match result {
                Ok(message) => {
                    let stored = extract_stored_file(&message, kind, size)?;
                    info!(
                        file_name,
                        kind = kind.as_str(),
                        remote_id = stored.remote_id,
                        message_id = stored.source_message_id,
                        "backend send complete"
                    );
                    return Ok(stored);
                }
                Err(SendError::Backend(err))
                    if kind != MediaKind::Document && err.is_media_rejection() =>
                {
                    warn!(
                        file_name,
                        kind = kind.as_str(),
                        error = %err,
                        "media rejected, retrying as document"
                    );
                    kind = MediaKind::Document;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
