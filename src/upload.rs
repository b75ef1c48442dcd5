//! 分片上传会话：乱序接收、顺序落盘，完成后交由发送器投递到后端。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json as JsonResponse;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, elapsed_between};
use crate::config::MAX_CHUNK_SIZE;
use crate::error::ApiError;
use crate::sender::{MediaSender, SendError, StoredFile};

const CHUNKS_DIR: &str = "chunks";
const ASSEMBLED_FILE: &str = "assembled.bin";
const DIRECT_PREFIX: &str = "direct-";

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub max_chunks: u64,
    pub session_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("{requested} chunks exceeds the limit of {limit}")]
    TooManyChunks { requested: u64, limit: u64 },
    #[error("upload session not found")]
    SessionNotFound,
    #[error("chunk index {index} is outside 0..{total}")]
    ChunkOutOfRange { index: u64, total: u64 },
    #[error("chunk exceeds {limit} bytes")]
    ChunkTooLarge { limit: u64 },
    #[error("{received} of {total} chunks received")]
    MissingChunks { received: u64, total: u64 },
    #[error("assembled file is empty")]
    EmptyFile,
    #[error("assembled {actual} bytes but {expected} were declared")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("upload is being finalized")]
    Finalizing,
    #[error("request body error: {0}")]
    Body(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(Debug)]
struct UploadSession {
    file_name: String,
    file_size: u64,
    mime_type: String,
    total_chunks: u64,
    received: Vec<bool>,
    received_count: u64,
    next_flush: u64,
    flushed_bytes: u64,
    /// 已落盘但尚未追加的分片字节数。
    buffered_bytes: u64,
    finalizing: bool,
    created_at: SystemTime,
}

impl UploadSession {
    fn is_received(&self, index: u64) -> bool {
        index < self.next_flush || self.received.get(index as usize).copied().unwrap_or(false)
    }

    /// 声明了大小时以声明值为上限，否则以全局上限为准。
    fn byte_limit(&self, max_file_size: u64) -> u64 {
        if self.file_size > 0 {
            self.file_size.min(max_file_size)
        } else {
            max_file_size
        }
    }
}

#[derive(Debug)]
struct SessionHandle {
    dir: PathBuf,
    state: Mutex<UploadSession>,
    /// 后端发送进度，以 `f64` 位模式存储。
    progress: AtomicU64,
}

impl SessionHandle {
    fn chunks_dir(&self) -> PathBuf {
        self.dir.join(CHUNKS_DIR)
    }

    fn part_path(&self, index: u64) -> PathBuf {
        self.chunks_dir().join(format!("{index}.part"))
    }

    fn assembled_path(&self) -> PathBuf {
        self.dir.join(ASSEMBLED_FILE)
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    /// 将连续已到达的分片追加到组装文件。
    ///
    /// 追加失败时组装文件截回 `flushed_bytes`，计数保持不变。
    async fn flush_ready(&self, session: &mut UploadSession) -> io::Result<()> {
        if !session
            .received
            .get(session.next_flush as usize)
            .copied()
            .unwrap_or(false)
        {
            return Ok(());
        }
        let mut assembled = OpenOptions::new()
            .append(true)
            .open(self.assembled_path())
            .await?;
        while session.next_flush < session.total_chunks
            && session.received[session.next_flush as usize]
        {
            let index = session.next_flush;
            let part_path = self.part_path(index);
            let copied = match append_part(&mut assembled, &part_path).await {
                Ok(copied) => copied,
                Err(err) => {
                    assembled.set_len(session.flushed_bytes).await?;
                    return Err(err);
                }
            };
            session.received[index as usize] = false;
            session.flushed_bytes += copied;
            session.buffered_bytes = session.buffered_bytes.saturating_sub(copied);
            session.next_flush += 1;
            debug!(chunk_index = index, bytes = copied, "chunk flushed");
            if let Err(err) = fs::remove_file(&part_path).await {
                warn!(path = ?part_path, error = %err, "failed to remove flushed chunk");
            }
        }
        Ok(())
    }
}

async fn append_part(assembled: &mut File, part_path: &Path) -> io::Result<u64> {
    let mut part = File::open(part_path).await?;
    let copied = tokio::io::copy(&mut part, assembled).await?;
    assembled.flush().await?;
    Ok(copied)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub received: u64,
    pub total_received: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub received_chunks: u64,
    pub total_chunks: u64,
    pub flushed_bytes: u64,
    pub backend_progress: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub sessions: usize,
    pub orphans: usize,
}

/// 新建会话参数。
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u64,
}

fn infer_mime(file_name: &str, declared: &str) -> String {
    let declared = declared.trim();
    if declared.is_empty() {
        mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    } else {
        declared.to_string()
    }
}

/// 将请求体流式写入 `target`，超过 `limit` 即失败。
async fn write_body(
    body: AxumBody,
    target: &Path,
    limit: u64,
    on_overflow: impl Fn() -> UploadError,
) -> Result<u64, UploadError> {
    let mut file = File::create(target).await?;
    let mut data_stream = BodyExt::into_data_stream(body);
    let mut total_written: u64 = 0;
    let result: Result<(), UploadError> = async {
        while let Some(chunk) = data_stream.next().await {
            let chunk = chunk.map_err(|err: AxumError| UploadError::Body(err.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            total_written += chunk.len() as u64;
            if total_written > limit {
                return Err(on_overflow());
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
    .await;
    drop(file);
    if let Err(err) = result {
        let _ = fs::remove_file(target).await;
        return Err(err);
    }
    Ok(total_written)
}

async fn remove_dir_quietly(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = ?dir, error = %err, "failed to remove upload dir"),
    }
}

/// 上传会话表，由 `main` 构造并注入。
#[derive(Debug)]
pub struct UploadSessions {
    root: PathBuf,
    config: UploadConfig,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl UploadSessions {
    pub fn new(root: PathBuf, config: UploadConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            root,
            config,
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn get(&self, upload_id: &str) -> Result<Arc<SessionHandle>, UploadError> {
        self.sessions
            .lock()
            .await
            .get(upload_id)
            .cloned()
            .ok_or(UploadError::SessionNotFound)
    }

    async fn forget(&self, upload_id: &str, handle: &SessionHandle) {
        self.sessions.lock().await.remove(upload_id);
        remove_dir_quietly(&handle.dir).await;
    }

    pub async fn init(&self, request: NewUpload) -> Result<String, UploadError> {
        let file_name = request.file_name.trim().to_string();
        if file_name.is_empty() {
            return Err(UploadError::MissingField("fileName"));
        }
        if request.total_chunks == 0 {
            return Err(UploadError::MissingField("totalChunks"));
        }
        if request.total_chunks > self.config.max_chunks {
            return Err(UploadError::TooManyChunks {
                requested: request.total_chunks,
                limit: self.config.max_chunks,
            });
        }
        if request.file_size > self.config.max_file_size {
            return Err(UploadError::TooLarge {
                size: request.file_size,
                limit: self.config.max_file_size,
            });
        }

        let upload_id = Uuid::new_v4().to_string();
        let dir = self.root.join(&upload_id);
        fs::create_dir_all(dir.join(CHUNKS_DIR)).await?;
        File::create(dir.join(ASSEMBLED_FILE)).await?;

        let mime_type = infer_mime(&file_name, &request.mime_type);
        info!(
            upload_id,
            name = file_name,
            file_size = request.file_size,
            total_chunks = request.total_chunks,
            mime_type,
            "init upload"
        );
        let session = UploadSession {
            file_name,
            file_size: request.file_size,
            mime_type,
            total_chunks: request.total_chunks,
            received: vec![false; request.total_chunks as usize],
            received_count: 0,
            next_flush: 0,
            flushed_bytes: 0,
            buffered_bytes: 0,
            finalizing: false,
            created_at: self.clock.now(),
        };
        let handle = Arc::new(SessionHandle {
            dir,
            state: Mutex::new(session),
            progress: AtomicU64::new(0f64.to_bits()),
        });
        self.sessions.lock().await.insert(upload_id.clone(), handle);
        Ok(upload_id)
    }

    /// 保存一个分片，并追加所有已连续的分片。
    pub async fn receive_chunk(
        &self,
        upload_id: &str,
        index: u64,
        body: AxumBody,
    ) -> Result<ChunkReceipt, UploadError> {
        let handle = self.get(upload_id).await?;
        {
            let session = handle.state.lock().await;
            if elapsed_between(session.created_at, self.clock.now()) > self.config.session_ttl {
                return Err(UploadError::SessionNotFound);
            }
            if session.finalizing {
                return Err(UploadError::Finalizing);
            }
            if index >= session.total_chunks {
                return Err(UploadError::ChunkOutOfRange {
                    index,
                    total: session.total_chunks,
                });
            }
        }

        let temp_path = handle
            .chunks_dir()
            .join(format!(".{index}.{}.tmp", Uuid::new_v4().simple()));
        let bytes = write_body(body, &temp_path, MAX_CHUNK_SIZE, || UploadError::ChunkTooLarge {
            limit: MAX_CHUNK_SIZE,
        })
        .await?;

        let mut session = handle.state.lock().await;
        if session.finalizing || session.is_received(index) {
            let _ = fs::remove_file(&temp_path).await;
            if session.finalizing {
                return Err(UploadError::Finalizing);
            }
            debug!(upload_id, chunk_index = index, "duplicate chunk ignored");
        } else {
            let limit = session.byte_limit(self.config.max_file_size);
            let total = session.flushed_bytes + session.buffered_bytes + bytes;
            if total > limit {
                drop(session);
                let _ = fs::remove_file(&temp_path).await;
                self.forget(upload_id, &handle).await;
                warn!(upload_id, chunk_index = index, total, limit, "upload exceeds size limit");
                return Err(UploadError::TooLarge { size: total, limit });
            }
            if let Err(err) = fs::rename(&temp_path, handle.part_path(index)).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
            session.received[index as usize] = true;
            session.received_count += 1;
            session.buffered_bytes += bytes;
            debug!(upload_id, chunk_index = index, bytes, "chunk stored");
            if let Err(err) = handle.flush_ready(&mut session).await {
                drop(session);
                self.forget(upload_id, &handle).await;
                warn!(upload_id, chunk_index = index, error = %err, "chunk flush failed, session dropped");
                return Err(err.into());
            }
        }

        Ok(ChunkReceipt {
            received: index,
            total_received: session.received_count,
            total_chunks: session.total_chunks,
        })
    }

    pub async fn status(&self, upload_id: &str) -> Result<UploadStatus, UploadError> {
        let handle = self.get(upload_id).await?;
        let session = handle.state.lock().await;
        Ok(UploadStatus {
            received_chunks: session.received_count,
            total_chunks: session.total_chunks,
            flushed_bytes: session.flushed_bytes,
            backend_progress: handle.progress(),
            created_at: session.created_at.into(),
        })
    }

    /// 校验并投递组装好的文件；校验通过后无论成败都清理会话。
    pub async fn complete(
        &self,
        upload_id: &str,
        sender: &MediaSender,
    ) -> Result<StoredFile, UploadError> {
        let handle = self.get(upload_id).await?;
        let (file_name, mime_type, file_size) = {
            let mut session = handle.state.lock().await;
            if session.received_count != session.total_chunks {
                return Err(UploadError::MissingChunks {
                    received: session.received_count,
                    total: session.total_chunks,
                });
            }
            if session.finalizing {
                return Err(UploadError::Finalizing);
            }
            session.finalizing = true;
            (
                session.file_name.clone(),
                session.mime_type.clone(),
                session.file_size,
            )
        };

        let result = self
            .deliver(&handle, &file_name, &mime_type, file_size, sender)
            .await;
        self.forget(upload_id, &handle).await;
        match &result {
            Ok(stored) => info!(
                upload_id,
                name = file_name,
                remote_id = stored.remote_id,
                size = stored.size,
                "upload complete"
            ),
            Err(err) => warn!(upload_id, name = file_name, error = %err, "upload finalize failed"),
        }
        result
    }

    async fn deliver(
        &self,
        handle: &SessionHandle,
        file_name: &str,
        mime_type: &str,
        file_size: u64,
        sender: &MediaSender,
    ) -> Result<StoredFile, UploadError> {
        let flushed = {
            let mut session = handle.state.lock().await;
            handle.flush_ready(&mut session).await?;
            session.flushed_bytes
        };
        if flushed == 0 {
            return Err(UploadError::EmptyFile);
        }
        if file_size > 0 && flushed != file_size {
            return Err(UploadError::SizeMismatch {
                expected: file_size,
                actual: flushed,
            });
        }
        if flushed > self.config.max_file_size {
            return Err(UploadError::TooLarge {
                size: flushed,
                limit: self.config.max_file_size,
            });
        }

        let on_progress = |fraction: f64| {
            handle.progress.store(fraction.to_bits(), Ordering::Relaxed);
        };
        let stored = sender
            .send(&handle.assembled_path(), file_name, mime_type, flushed, &on_progress)
            .await?;
        Ok(stored)
    }

    pub async fn abort(&self, upload_id: &str) -> Result<(), UploadError> {
        let handle = self.get(upload_id).await?;
        if handle.state.lock().await.finalizing {
            return Err(UploadError::Finalizing);
        }
        self.forget(upload_id, &handle).await;
        info!(upload_id, "upload aborted");
        Ok(())
    }

    /// 单次上传：整体写入临时文件后直接投递，临时文件总是删除。
    pub async fn store_direct(
        &self,
        file_name: &str,
        mime_type: &str,
        body: AxumBody,
        sender: &MediaSender,
    ) -> Result<StoredFile, UploadError> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::MissingField("name"));
        }
        fs::create_dir_all(&self.root).await?;
        let path = self
            .root
            .join(format!("{DIRECT_PREFIX}{}.bin", Uuid::new_v4().simple()));
        let limit = self.config.max_file_size;
        let size = write_body(body, &path, limit, || UploadError::TooLarge {
            size: limit + 1,
            limit,
        })
        .await?;

        let mime_type = infer_mime(file_name, mime_type);
        let result = if size == 0 {
            Err(UploadError::EmptyFile)
        } else {
            sender
                .send(&path, file_name, &mime_type, size, &|_: f64| {})
                .await
                .map_err(UploadError::from)
        };
        if let Err(err) = fs::remove_file(&path).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = ?path, error = %err, "failed to remove direct upload file");
        }
        if let Ok(stored) = &result {
            info!(name = file_name, remote_id = stored.remote_id, size, "direct upload complete");
        }
        result
    }

    /// 回收超过 TTL 的会话，以及不属于任何存活会话的暂存残留。
    pub async fn reap_expired(&self) -> ReapReport {
        let now = self.clock.now();
        let ttl = self.config.session_ttl;
        let mut report = ReapReport::default();

        let (expired, live_dirs) = {
            let mut sessions = self.sessions.lock().await;
            let mut expired = Vec::new();
            for (id, handle) in sessions.iter() {
                let Ok(session) = handle.state.try_lock() else {
                    continue;
                };
                if !session.finalizing && elapsed_between(session.created_at, now) > ttl {
                    expired.push(id.clone());
                }
            }
            let removed: Vec<(String, Arc<SessionHandle>)> = expired
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|handle| (id, handle)))
                .collect();
            let live: HashSet<PathBuf> = sessions.values().map(|h| h.dir.clone()).collect();
            (removed, live)
        };

        for (id, handle) in expired {
            remove_dir_quietly(&handle.dir).await;
            info!(upload_id = id, "expired upload session reaped");
            report.sessions += 1;
        }

        match self.remove_orphans(&live_dirs, now, ttl).await {
            Ok(count) => report.orphans = count,
            Err(err) => warn!(error = %err, "failed to scan upload staging dir"),
        }
        report
    }

    async fn remove_orphans(
        &self,
        live_dirs: &HashSet<PathBuf>,
        now: SystemTime,
        ttl: Duration,
    ) -> io::Result<usize> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if live_dirs.contains(&path) {
                continue;
            }
            let metadata = entry.metadata().await?;
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if elapsed_between(modified, now) <= ttl {
                continue;
            }
            let result = if metadata.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    info!(path = ?path, "removed stale upload leftover");
                    removed += 1;
                }
                Err(err) => warn!(path = ?path, error = %err, "failed to remove stale upload leftover"),
            }
        }
        Ok(removed)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitRequest {
    #[serde(default)]
    file_name: String,
    /// 必填；`0` 表示大小未知，完成时不做大小核对。
    file_size: Option<u64>,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    total_chunks: u64,
}

impl UploadInitRequest {
    fn into_new_upload(self) -> Result<NewUpload, UploadError> {
        let file_size = self.file_size.ok_or(UploadError::MissingField("fileSize"))?;
        Ok(NewUpload {
            file_name: self.file_name,
            file_size,
            mime_type: self.mime_type,
            total_chunks: self.total_chunks,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitResponse {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadIdQuery {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadIdBody {
    upload_id: String,
}

#[derive(Deserialize)]
pub(crate) struct DirectUploadQuery {
    name: String,
    #[serde(default)]
    mime: String,
}

/// 初始化上传会话。
pub async fn init_upload(
    Extension(sessions): Extension<Arc<UploadSessions>>,
    Json(payload): Json<UploadInitRequest>,
) -> Result<JsonResponse<UploadInitResponse>, ApiError> {
    let upload_id = sessions.init(payload.into_new_upload()?).await?;
    Ok(JsonResponse(UploadInitResponse { upload_id }))
}

/// 上传单个分片，序号由 `X-Chunk-Index` 给出。
pub async fn upload_chunk(
    Query(UploadIdQuery { upload_id }): Query<UploadIdQuery>,
    headers: HeaderMap,
    Extension(sessions): Extension<Arc<UploadSessions>>,
    body: AxumBody,
) -> Result<JsonResponse<ChunkReceipt>, ApiError> {
    let chunk_index = headers
        .get("X-Chunk-Index")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or(UploadError::MissingField("X-Chunk-Index"))?;
    let receipt = sessions.receive_chunk(&upload_id, chunk_index, body).await?;
    Ok(JsonResponse(receipt))
}

pub async fn upload_status(
    Query(UploadIdQuery { upload_id }): Query<UploadIdQuery>,
    Extension(sessions): Extension<Arc<UploadSessions>>,
) -> Result<JsonResponse<UploadStatus>, ApiError> {
    Ok(JsonResponse(sessions.status(&upload_id).await?))
}

pub async fn complete_upload(
    Extension(sessions): Extension<Arc<UploadSessions>>,
    Extension(sender): Extension<Arc<MediaSender>>,
    Json(payload): Json<UploadIdBody>,
) -> Result<JsonResponse<StoredFile>, ApiError> {
    let stored = sessions.complete(&payload.upload_id, &sender).await?;
    Ok(JsonResponse(stored))
}

/// 中止上传并清理临时目录。
pub async fn abort_upload(
    Extension(sessions): Extension<Arc<UploadSessions>>,
    Json(payload): Json<UploadIdBody>,
) -> Result<StatusCode, ApiError> {
    sessions.abort(&payload.upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_file(
    Query(query): Query<DirectUploadQuery>,
    Extension(sessions): Extension<Arc<UploadSessions>>,
    Extension(sender): Extension<Arc<MediaSender>>,
    body: AxumBody,
) -> Result<JsonResponse<StoredFile>, ApiError> {
    let stored = sessions
        .store_direct(&query.name, &query.mime, body, &sender)
        .await?;
    Ok(JsonResponse(stored))
}
