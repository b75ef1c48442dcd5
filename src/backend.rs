//! 远端消息平台边界：客户端 trait、消息内容变体与错误类型。

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

/// 发送消息所用的内容形态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

/// 待发送的本地文件。
#[derive(Debug, Clone)]
pub struct OutgoingMedia {
    pub kind: MediaKind,
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
}

/// 后端中单个已存文件的句柄。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// 可移植的字符串标识，调用方持久化的就是它。
    pub remote_id: String,
    /// 后端内部数字标识（若后端提供）。
    pub internal_id: Option<i64>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoSize {
    pub file: FileDescriptor,
    pub width: u32,
    pub height: u32,
}

/// 消息内容：每种媒体类型的文件描述嵌套方式不同。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Photo {
        sizes: Vec<PhotoSize>,
    },
    Video {
        file: FileDescriptor,
        thumbnail: Option<PhotoSize>,
    },
    Audio {
        file: FileDescriptor,
        thumbnail: Option<PhotoSize>,
    },
    Document {
        file: FileDescriptor,
        thumbnail: Option<PhotoSize>,
    },
    Unsupported,
}

impl MessageContent {
    /// 主文件：照片取最大尺寸。
    pub fn primary_file(&self) -> Option<&FileDescriptor> {
        match self {
            MessageContent::Photo { sizes } => sizes
                .iter()
                .max_by_key(|size| u64::from(size.width) * u64::from(size.height))
                .map(|size| &size.file),
            MessageContent::Video { file, .. }
            | MessageContent::Audio { file, .. }
            | MessageContent::Document { file, .. } => Some(file),
            MessageContent::Unsupported => None,
        }
    }

    /// 缩略图：照片取最小尺寸（仅在存在多个尺寸时）。
    pub fn thumbnail(&self) -> Option<&PhotoSize> {
        match self {
            MessageContent::Photo { sizes } if sizes.len() > 1 => sizes
                .iter()
                .min_by_key(|size| u64::from(size.width) * u64::from(size.height)),
            MessageContent::Photo { .. } => None,
            MessageContent::Video { thumbnail, .. }
            | MessageContent::Audio { thumbnail, .. }
            | MessageContent::Document { thumbnail, .. } => thumbnail.as_ref(),
            MessageContent::Unsupported => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub message_id: i64,
    pub content: MessageContent,
}

/// 发送过程中由后端异步推送的事件。
#[derive(Debug)]
pub enum SendEvent {
    Progress { sent: u64, total: u64 },
    Delivered(RemoteMessage),
    Failed(BackendError),
}

/// 已提交的发送；完成与否由事件通道告知。
pub struct PendingSend {
    pub events: mpsc::UnboundedReceiver<SendEvent>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("remote file or message not found")]
    NotFound,
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("backend failure: {0}")]
    Other(String),
}

const MEDIA_REJECTION_MARKERS: &[&str] = &[
    "image_process_failed",
    "photo_invalid_dimensions",
    "photo_ext_invalid",
    "photo_save_file_invalid",
    "photo_content_type_invalid",
    "media_invalid",
    "video_content_type_invalid",
    "audio_content_type_invalid",
    "wrong file type",
    "wrong type of the web page content",
    "failed to get http url content",
];

impl BackendError {
    /// 因媒体形态（格式、尺寸、内容类型）被拒绝，而非请求本身有误。
    /// 此类发送可改为普通文档重试。
    pub fn is_media_rejection(&self) -> bool {
        let BackendError::Rejected(message) = self else {
            return false;
        };
        let message = message.to_ascii_lowercase();
        MEDIA_REJECTION_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

/// 作为对象存储使用的消息平台客户端。
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// 提交发送；返回后通过事件通道等待完成。
    async fn send_media(&self, media: OutgoingMedia) -> Result<PendingSend, BackendError>;

    /// 客户端本地存储中已有的完整副本。
    async fn local_copy(&self, remote_id: &str) -> Result<Option<PathBuf>, BackendError>;

    /// 同步拉取文件到本地，返回路径。
    async fn download(&self, remote_id: &str) -> Result<PathBuf, BackendError>;

    async fn cancel_download(&self, remote_id: &str) -> Result<(), BackendError>;

    /// 清除客户端对该文件缓存的元数据。
    async fn reset_file_state(&self, remote_id: &str) -> Result<(), BackendError>;

    async fn resolve(&self, remote_id: &str) -> Result<FileDescriptor, BackendError>;

    /// 重新发出（转发）消息，返回新副本。
    async fn forward_message(&self, message_id: i64) -> Result<RemoteMessage, BackendError>;

    async fn delete_messages(&self, message_ids: &[i64]) -> Result<(), BackendError>;

    /// 单次删除调用允许的最大消息数。
    fn delete_batch_limit(&self) -> usize {
        100
    }
}

pub const REMOTE_ID_MAX_LEN: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteIdError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier is too long")]
    TooLong,
    #[error("identifier contains invalid characters")]
    InvalidCharacters,
    #[error("identifier is a backend-internal numeric id")]
    NumericId,
}

/// 校验远端文件标识的格式（不访问后端）。
pub fn validate_remote_id(remote_id: &str) -> Result<(), RemoteIdError> {
    if remote_id.is_empty() {
        return Err(RemoteIdError::Empty);
    }
    if remote_id.len() > REMOTE_ID_MAX_LEN {
        return Err(RemoteIdError::TooLong);
    }
    if !remote_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(RemoteIdError::InvalidCharacters);
    }
    if remote_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RemoteIdError::NumericId);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> FileDescriptor {
        FileDescriptor {
            remote_id: id.to_string(),
            internal_id: None,
            size: None,
        }
    }

    #[test]
    fn photo_resolves_largest_as_file_and_smallest_as_thumbnail() {
        let content = MessageContent::Photo {
            sizes: vec![
                PhotoSize {
                    file: descriptor("mid"),
                    width: 320,
                    height: 240,
                },
                PhotoSize {
                    file: descriptor("small"),
                    width: 90,
                    height: 60,
                },
                PhotoSize {
                    file: descriptor("large"),
                    width: 1280,
                    height: 960,
                },
            ],
        };
        assert_eq!(content.primary_file().map(|f| f.remote_id.as_str()), Some("large"));
        assert_eq!(
            content.thumbnail().map(|t| t.file.remote_id.as_str()),
            Some("small")
        );
    }

    #[test]
    fn single_size_photo_has_no_thumbnail() {
        let content = MessageContent::Photo {
            sizes: vec![PhotoSize {
                file: descriptor("only"),
                width: 10,
                height: 10,
            }],
        };
        assert!(content.thumbnail().is_none());
        assert!(MessageContent::Unsupported.primary_file().is_none());
    }

    #[test]
    fn media_rejection_matches_markers_only() {
        assert!(BackendError::Rejected("Bad Request: IMAGE_PROCESS_FAILED".into()).is_media_rejection());
        assert!(BackendError::Rejected("Bad Request: wrong file type".into()).is_media_rejection());
        assert!(!BackendError::Rejected("Bad Request: chat not found".into()).is_media_rejection());
        assert!(!BackendError::Other("IMAGE_PROCESS_FAILED".into()).is_media_rejection());
    }

    #[test]
    fn remote_id_validation() {
        assert_eq!(validate_remote_id("BQACAgIAAxkB-_9"), Ok(()));
        assert_eq!(validate_remote_id(""), Err(RemoteIdError::Empty));
        assert_eq!(validate_remote_id("1234567"), Err(RemoteIdError::NumericId));
        assert_eq!(
            validate_remote_id("../etc/passwd"),
            Err(RemoteIdError::InvalidCharacters)
        );
        assert_eq!(
            validate_remote_id(&"a".repeat(REMOTE_ID_MAX_LEN + 1)),
            Err(RemoteIdError::TooLong)
        );
    }
}
