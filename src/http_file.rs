//! Bot API 的 HTTP 文件通道：`getFile` 取路径后整文件拉取到临时目录。

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::atomic::AtomicFile;
use crate::backend::BackendError;
use crate::storage::scratch_file_name;

const NOT_FOUND_MARKERS: &[&str] = &[
    "file not found",
    "wrong file identifier",
    "invalid file_id",
    "message to forward not found",
    "message not found",
];

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Bot API 统一响应外壳。
#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

impl<T> ApiEnvelope<T> {
    pub(crate) fn into_result(self) -> Result<T, BackendError> {
        if self.ok
            && let Some(result) = self.result
        {
            return Ok(result);
        }
        let description = self
            .description
            .unwrap_or_else(|| "request failed".to_string());
        Err(match self.error_code {
            Some(429) => BackendError::RateLimited {
                retry_after: self
                    .parameters
                    .and_then(|params| params.retry_after)
                    .unwrap_or(0),
            },
            Some(400) if is_not_found(&description) => BackendError::NotFound,
            Some(400) => BackendError::Rejected(description),
            _ => BackendError::Other(description),
        })
    }
}

fn is_not_found(description: &str) -> bool {
    let lowered = description.to_ascii_lowercase();
    NOT_FOUND_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

pub(crate) fn transport_error(err: reqwest::Error) -> BackendError {
    BackendError::Other(err.without_url().to_string())
}

/// 解析 Bot API 响应；响应体不是 JSON 信封时按 HTTP 状态码判断。
pub(crate) async fn read_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(transport_error)?;
    match serde_json::from_slice::<ApiEnvelope<T>>(&bytes) {
        Ok(envelope) => envelope.into_result(),
        Err(_) => Err(status_error(status, None)),
    }
}

fn status_error(status: StatusCode, retry_after: Option<u64>) -> BackendError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited {
            retry_after: retry_after.unwrap_or(0),
        },
        StatusCode::NOT_FOUND => BackendError::NotFound,
        other => BackendError::Other(format!("unexpected status {other}")),
    }
}

/// `getFile` 结果。
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    pub file_size: Option<u64>,
    pub file_path: Option<String>,
}

/// 通过 HTTP 将完整文件下载到 scratch 目录。
#[derive(Debug, Clone)]
pub struct HttpFileClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    scratch_root: PathBuf,
    max_bytes: u64,
}

impl HttpFileClient {
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        token: &str,
        scratch_root: PathBuf,
        max_bytes: u64,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            scratch_root,
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub(crate) fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    pub async fn file_info(&self, remote_id: &str) -> Result<RemoteFile, BackendError> {
        let response = self
            .client
            .post(self.method_url("getFile"))
            .json(&json!({ "file_id": remote_id }))
            .send()
            .await
            .map_err(transport_error)?;
        read_envelope(response).await
    }

    /// 拉取整文件；声明大小或实际字节数超过上限即失败。
    pub async fn fetch(&self, remote_id: &str) -> Result<PathBuf, BackendError> {
        let info = self.file_info(remote_id).await?;
        if let Some(size) = info.file_size
            && size > self.max_bytes
        {
            return Err(BackendError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        let file_path = info
            .file_path
            .ok_or_else(|| BackendError::Other("getFile returned no file_path".into()))?;

        let response = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            return Err(status_error(status, retry_after));
        }
        if let Some(length) = response.content_length()
            && length > self.max_bytes
        {
            return Err(BackendError::TooLarge {
                size: length,
                limit: self.max_bytes,
            });
        }

        let target = self.scratch_root.join(scratch_file_name(remote_id));
        let mut atomic = AtomicFile::new(&target)
            .await
            .map_err(|err| BackendError::Other(err.to_string()))?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    atomic.cleanup().await;
                    return Err(transport_error(err));
                }
            };
            written += chunk.len() as u64;
            if written > self.max_bytes {
                atomic.cleanup().await;
                return Err(BackendError::TooLarge {
                    size: written,
                    limit: self.max_bytes,
                });
            }
            if let Err(err) = atomic.write_all(&chunk).await {
                atomic.cleanup().await;
                return Err(BackendError::Other(err.to_string()));
            }
        }
        debug!(remote_id, bytes = written, "http file body received");
        let path = atomic
            .finalize()
            .await
            .map_err(|err| BackendError::Other(err.to_string()))?;
        info!(remote_id, bytes = written, "fetched file over http");
        Ok(path)
    }
}
