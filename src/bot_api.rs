//! 基于 Bot API 的远端后端。

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::backend::{
    BackendError, FileDescriptor, MediaKind, MessageContent, OutgoingMedia, PendingSend,
    PhotoSize, RemoteBackend, RemoteMessage, SendEvent,
};
use crate::http_file::{HttpFileClient, read_envelope, transport_error};

const DELETE_BATCH_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
    width: u32,
    height: u32,
    file_size: Option<u64>,
}

impl TgPhotoSize {
    fn into_photo_size(self) -> PhotoSize {
        PhotoSize {
            file: FileDescriptor {
                remote_id: self.file_id,
                internal_id: None,
                size: self.file_size,
            },
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TgMedia {
    file_id: String,
    file_size: Option<u64>,
    thumbnail: Option<TgPhotoSize>,
}

impl TgMedia {
    fn split(self) -> (FileDescriptor, Option<PhotoSize>) {
        (
            FileDescriptor {
                remote_id: self.file_id,
                internal_id: None,
                size: self.file_size,
            },
            self.thumbnail.map(TgPhotoSize::into_photo_size),
        )
    }
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    photo: Option<Vec<TgPhotoSize>>,
    video: Option<TgMedia>,
    audio: Option<TgMedia>,
    document: Option<TgMedia>,
}

impl TgMessage {
    fn into_remote(self) -> RemoteMessage {
        let content = if let Some(sizes) = self.photo {
            MessageContent::Photo {
                sizes: sizes.into_iter().map(TgPhotoSize::into_photo_size).collect(),
            }
        } else if let Some(video) = self.video {
            let (file, thumbnail) = video.split();
            MessageContent::Video { file, thumbnail }
        } else if let Some(audio) = self.audio {
            let (file, thumbnail) = audio.split();
            MessageContent::Audio { file, thumbnail }
        } else if let Some(document) = self.document {
            let (file, thumbnail) = document.split();
            MessageContent::Document { file, thumbnail }
        } else {
            MessageContent::Unsupported
        };
        RemoteMessage {
            message_id: self.message_id,
            content,
        }
    }
}

fn send_method(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "sendPhoto",
        MediaKind::Video => "sendVideo",
        MediaKind::Audio => "sendAudio",
        MediaKind::Document => "sendDocument",
    }
}

fn is_already_deleted(err: &BackendError) -> bool {
    match err {
        BackendError::NotFound => true,
        BackendError::Rejected(message) => message
            .to_ascii_lowercase()
            .contains("message to delete not found"),
        _ => false,
    }
}

pub struct BotApiBackend {
    client: reqwest::Client,
    files: Arc<HttpFileClient>,
    chat_id: i64,
}

impl BotApiBackend {
    pub fn new(client: reqwest::Client, files: Arc<HttpFileClient>, chat_id: i64) -> Self {
        Self {
            client,
            files,
            chat_id,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, BackendError> {
        let response = self
            .client
            .post(self.files.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        read_envelope(response).await
    }

    /// 构造带进度统计的 multipart 表单。
    async fn upload_form(
        &self,
        media: &OutgoingMedia,
        events: mpsc::UnboundedSender<SendEvent>,
    ) -> Result<Form, BackendError> {
        let file = File::open(&media.path)
            .await
            .map_err(|err| BackendError::Other(err.to_string()))?;
        let total = media.size;
        let mut sent: u64 = 0;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                let _ = events.send(SendEvent::Progress { sent, total });
            }
            chunk
        });
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(media.file_name.clone())
            .mime_str(&media.mime_type)
            .map_err(|_| BackendError::Rejected(format!("invalid mime type {}", media.mime_type)))?;
        Ok(Form::new()
            .text("chat_id", self.chat_id.to_string())
            .part(media.kind.as_str(), part))
    }
}

#[async_trait]
impl RemoteBackend for BotApiBackend {
    fn name(&self) -> &'static str {
        "bot-api"
    }

    async fn send_media(&self, media: OutgoingMedia) -> Result<PendingSend, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let form = self.upload_form(&media, tx.clone()).await?;
        let request = self
            .client
            .post(self.files.method_url(send_method(media.kind)))
            .multipart(form);
        let kind = media.kind;

        tokio::spawn(async move {
            let result = async {
                let response = request.send().await.map_err(transport_error)?;
                let message: TgMessage = read_envelope(response).await?;
                Ok::<_, BackendError>(message.into_remote())
            }
            .await;
            let event = match result {
                Ok(message) => {
                    debug!(kind = kind.as_str(), message_id = message.message_id, "bot api send delivered");
                    SendEvent::Delivered(message)
                }
                Err(err) => SendEvent::Failed(err),
            };
            let _ = tx.send(event);
        });

        Ok(PendingSend { events: rx })
    }

    async fn local_copy(&self, _remote_id: &str) -> Result<Option<PathBuf>, BackendError> {
        Ok(None)
    }

    async fn download(&self, remote_id: &str) -> Result<PathBuf, BackendError> {
        self.files.fetch(remote_id).await
    }

    async fn cancel_download(&self, _remote_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn reset_file_state(&self, _remote_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn resolve(&self, remote_id: &str) -> Result<FileDescriptor, BackendError> {
        let info = self.files.file_info(remote_id).await?;
        Ok(FileDescriptor {
            remote_id: info.file_id,
            internal_id: None,
            size: info.file_size,
        })
    }

    async fn forward_message(&self, message_id: i64) -> Result<RemoteMessage, BackendError> {
        let message: TgMessage = self
            .call(
                "forwardMessage",
                json!({
                    "chat_id": self.chat_id,
                    "from_chat_id": self.chat_id,
                    "message_id": message_id,
                    "disable_notification": true,
                }),
            )
            .await?;
        Ok(message.into_remote())
    }

    async fn delete_messages(&self, message_ids: &[i64]) -> Result<(), BackendError> {
        for batch in message_ids.chunks(DELETE_BATCH_LIMIT) {
            let result: Result<bool, BackendError> = self
                .call(
                    "deleteMessages",
                    json!({ "chat_id": self.chat_id, "message_ids": batch }),
                )
                .await;
            match result {
                Ok(_) => {}
                Err(err) if is_already_deleted(&err) => {
                    warn!(count = batch.len(), "messages already gone");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn delete_batch_limit(&self) -> usize {
        DELETE_BATCH_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Json, Response};
    use axum::routing::post;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn maps_message_variants() {
        let photo: TgMessage = serde_json::from_value(json!({
            "message_id": 5,
            "photo": [
                { "file_id": "small", "width": 90, "height": 60, "file_size": 900 },
                { "file_id": "large", "width": 1280, "height": 720, "file_size": 90000 }
            ]
        }))
        .expect("photo");
        let photo = photo.into_remote();
        assert_eq!(
            photo.content.primary_file().map(|f| f.remote_id.as_str()),
            Some("large")
        );
        assert_eq!(
            photo.content.thumbnail().map(|t| t.file.remote_id.as_str()),
            Some("small")
        );

        let text: TgMessage =
            serde_json::from_value(json!({ "message_id": 6, "text": "hi" })).expect("text");
        assert_eq!(text.into_remote().content, MessageContent::Unsupported);
    }

    async fn send_document(body: Bytes) -> Json<Value> {
        let marker = body.windows(7).any(|w| w == b"payload");
        Json(json!({
            "ok": marker,
            "result": {
                "message_id": 42,
                "document": {
                    "file_id": "BQACdoc",
                    "file_size": 7,
                    "thumbnail": { "file_id": "AAthumb", "width": 32, "height": 32 }
                }
            }
        }))
    }

    async fn delete_messages(Json(body): Json<Value>) -> Response {
        if body["message_ids"] == json!([1, 2]) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "ok": false,
                    "error_code": 400,
                    "description": "Bad Request: message to delete not found"
                })),
            )
                .into_response();
        }
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: chat not found"
            })),
        )
            .into_response()
    }

    async fn backend() -> BotApiBackend {
        let app = Router::new()
            .route("/botTEST/sendDocument", post(send_document))
            .route("/botTEST/deleteMessages", post(delete_messages));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let files = HttpFileClient::new(
            reqwest::Client::new(),
            &format!("http://{addr}"),
            "TEST",
            std::env::temp_dir(),
            1024,
        );
        BotApiBackend::new(reqwest::Client::new(), Arc::new(files), -100)
    }

    #[tokio::test]
    async fn document_send_streams_file_and_reports_progress() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("doc.txt");
        std::fs::write(&path, b"payload").expect("write");
        let backend = backend().await;

        let mut pending = backend
            .send_media(OutgoingMedia {
                kind: MediaKind::Document,
                path,
                file_name: "doc.txt".into(),
                mime_type: "text/plain".into(),
                size: 7,
            })
            .await
            .expect("send");

        let mut saw_progress = false;
        let message = loop {
            match pending.events.recv().await {
                Some(SendEvent::Progress { .. }) => saw_progress = true,
                Some(SendEvent::Delivered(message)) => break message,
                other => panic!("unexpected event {other:?}"),
            }
        };
        assert!(saw_progress);
        assert_eq!(message.message_id, 42);
        assert_eq!(
            message.content.thumbnail().map(|t| t.file.remote_id.as_str()),
            Some("AAthumb")
        );
    }

    #[tokio::test]
    async fn delete_treats_missing_messages_as_done() {
        let backend = backend().await;
        assert_eq!(backend.delete_messages(&[1, 2]).await, Ok(()));
        assert!(matches!(
            backend.delete_messages(&[3]).await,
            Err(BackendError::Rejected(_))
        ));
    }
}
