//! 本地目录实现的后端：文件存于数据目录，消息仅保存在内存。

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::backend::{
    BackendError, FileDescriptor, MediaKind, MessageContent, OutgoingMedia, PendingSend,
    PhotoSize, RemoteBackend, RemoteMessage, SendEvent, validate_remote_id,
};

const COPY_BLOCK_SIZE: usize = 256 * 1024;

pub struct LocalBackend {
    files_root: PathBuf,
    messages: Arc<Mutex<HashMap<i64, RemoteMessage>>>,
    next_message_id: Arc<AtomicI64>,
    next_internal_id: Arc<AtomicI64>,
}

impl LocalBackend {
    pub fn new(backend_root: &Path) -> Self {
        Self {
            files_root: backend_root.join("files"),
            messages: Arc::new(Mutex::new(HashMap::new())),
            next_message_id: Arc::new(AtomicI64::new(1)),
            next_internal_id: Arc::new(AtomicI64::new(1)),
        }
    }

    fn file_path(&self, remote_id: &str) -> Result<PathBuf, BackendError> {
        validate_remote_id(remote_id).map_err(|_| BackendError::NotFound)?;
        Ok(self.files_root.join(remote_id))
    }

    async fn stored_size(&self, remote_id: &str) -> Result<u64, BackendError> {
        let path = self.file_path(remote_id)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
            Ok(_) => Err(BackendError::NotFound),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BackendError::NotFound),
            Err(err) => Err(BackendError::Other(err.to_string())),
        }
    }
}

fn message_content(kind: MediaKind, file: FileDescriptor) -> MessageContent {
    match kind {
        MediaKind::Photo => MessageContent::Photo {
            sizes: vec![PhotoSize {
                file,
                width: 0,
                height: 0,
            }],
        },
        MediaKind::Video => MessageContent::Video {
            file,
            thumbnail: None,
        },
        MediaKind::Audio => MessageContent::Audio {
            file,
            thumbnail: None,
        },
        MediaKind::Document => MessageContent::Document {
            file,
            thumbnail: None,
        },
    }
}

/// 分块复制并逐块上报进度。
async fn copy_with_progress(
    source: &Path,
    target: &Path,
    total: u64,
    events: &mpsc::UnboundedSender<SendEvent>,
) -> io::Result<u64> {
    let mut input = File::open(source).await?;
    let mut output = AtomicFile::new(target).await?;
    let mut buffer = vec![0u8; COPY_BLOCK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let read = match input.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                output.cleanup().await;
                return Err(err);
            }
        };
        if let Err(err) = output.write_all(&buffer[..read]).await {
            output.cleanup().await;
            return Err(err);
        }
        sent += read as u64;
        let _ = events.send(SendEvent::Progress { sent, total });
    }
    output.finalize().await?;
    Ok(sent)
}

#[async_trait]
impl RemoteBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn send_media(&self, media: OutgoingMedia) -> Result<PendingSend, BackendError> {
        fs::metadata(&media.path)
            .await
            .map_err(|err| BackendError::Other(err.to_string()))?;

        let remote_id = format!("L{}", Uuid::new_v4().simple());
        let target = self.files_root.join(&remote_id);
        let internal_id = self.next_internal_id.fetch_add(1, Ordering::SeqCst);
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let messages = self.messages.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            match copy_with_progress(&media.path, &target, media.size, &tx).await {
                Ok(written) => {
                    let file = FileDescriptor {
                        remote_id: remote_id.clone(),
                        internal_id: Some(internal_id),
                        size: Some(written),
                    };
                    let message = RemoteMessage {
                        message_id,
                        content: message_content(media.kind, file),
                    };
                    messages.lock().await.insert(message_id, message.clone());
                    info!(
                        remote_id,
                        message_id,
                        kind = media.kind.as_str(),
                        bytes = written,
                        "stored file in local backend"
                    );
                    let _ = tx.send(SendEvent::Delivered(message));
                }
                Err(err) => {
                    let _ = tx.send(SendEvent::Failed(BackendError::Other(err.to_string())));
                }
            }
        });

        Ok(PendingSend { events: rx })
    }

    async fn local_copy(&self, remote_id: &str) -> Result<Option<PathBuf>, BackendError> {
        match self.stored_size(remote_id).await {
            Ok(_) => Ok(Some(self.file_path(remote_id)?)),
            Err(BackendError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn download(&self, remote_id: &str) -> Result<PathBuf, BackendError> {
        self.stored_size(remote_id).await?;
        self.file_path(remote_id)
    }

    async fn cancel_download(&self, remote_id: &str) -> Result<(), BackendError> {
        debug!(remote_id, "local backend has no transfers to cancel");
        Ok(())
    }

    async fn reset_file_state(&self, _remote_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn resolve(&self, remote_id: &str) -> Result<FileDescriptor, BackendError> {
        let size = self.stored_size(remote_id).await?;
        Ok(FileDescriptor {
            remote_id: remote_id.to_string(),
            internal_id: None,
            size: Some(size),
        })
    }

    async fn forward_message(&self, message_id: i64) -> Result<RemoteMessage, BackendError> {
        let mut messages = self.messages.lock().await;
        let original = messages
            .get(&message_id)
            .cloned()
            .ok_or(BackendError::NotFound)?;
        let copy = RemoteMessage {
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
            content: original.content,
        };
        messages.insert(copy.message_id, copy.clone());
        Ok(copy)
    }

    async fn delete_messages(&self, message_ids: &[i64]) -> Result<(), BackendError> {
        let mut messages = self.messages.lock().await;
        for id in message_ids {
            messages.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn send(backend: &LocalBackend, path: &Path, size: u64) -> (Vec<SendEvent>, RemoteMessage) {
        let mut pending = backend
            .send_media(OutgoingMedia {
                kind: MediaKind::Document,
                path: path.to_path_buf(),
                file_name: "blob.bin".into(),
                mime_type: "application/octet-stream".into(),
                size,
            })
            .await
            .expect("send");
        let mut events = Vec::new();
        while let Some(event) = pending.events.recv().await {
            if let SendEvent::Delivered(message) = event {
                return (events, message);
            }
            events.push(event);
        }
        panic!("send never delivered");
    }

    #[tokio::test]
    async fn send_reports_progress_per_block_and_stores_file() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("source.bin");
        let payload = vec![3u8; COPY_BLOCK_SIZE * 2 + 10];
        std::fs::write(&source, &payload).expect("write");
        let backend = LocalBackend::new(&temp.path().join("backend"));

        let (progress, message) = send(&backend, &source, payload.len() as u64).await;
        assert!(progress.len() >= 3);
        assert!(matches!(
            progress.last(),
            Some(SendEvent::Progress { sent, total }) if sent == total
        ));
        let file = message.content.primary_file().cloned().expect("file");
        assert!(file.remote_id.starts_with('L'));
        assert_eq!(file.size, Some(payload.len() as u64));

        let copy = backend
            .local_copy(&file.remote_id)
            .await
            .expect("local copy")
            .expect("present");
        assert_eq!(std::fs::read(copy).expect("read"), payload);
    }

    #[tokio::test]
    async fn forward_and_delete_messages() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("source.bin");
        std::fs::write(&source, b"abc").expect("write");
        let backend = LocalBackend::new(&temp.path().join("backend"));
        let (_, message) = send(&backend, &source, 3).await;

        let copy = backend
            .forward_message(message.message_id)
            .await
            .expect("forward");
        assert_ne!(copy.message_id, message.message_id);
        assert_eq!(copy.content, message.content);

        backend
            .delete_messages(&[copy.message_id, 9_999])
            .await
            .expect("delete");
        assert_eq!(
            backend.forward_message(copy.message_id).await,
            Err(BackendError::NotFound)
        );
    }

    #[tokio::test]
    async fn unknown_files_are_not_found() {
        let temp = tempdir().expect("tempdir");
        let backend = LocalBackend::new(&temp.path().join("backend"));
        assert_eq!(backend.local_copy("Lmissing").await, Ok(None));
        assert_eq!(backend.resolve("Lmissing").await, Err(BackendError::NotFound));
        assert_eq!(backend.download("../x").await, Err(BackendError::NotFound));
    }
}
