//! 下载编排：按层级依次尝试，直到拿到本地可读文件。

use axum::extract::{Extension, Json, Path, Query};
use axum::http::HeaderMap;
use axum::response::{Json as JsonResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, RemoteBackend, RemoteIdError, validate_remote_id};
use crate::cache::{CachedFile, FileCache};
use crate::config::MAX_LINK_TTL_SECS;
use crate::error::ApiError;
use crate::http_file::HttpFileClient;
use crate::messages::MessageLifecycle;
use crate::stream::{ServeOptions, serve_file};
use crate::token::{IssuedLink, LinkClaims, LinkSigner};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    InvalidIdentifier(#[from] RemoteIdError),
    #[error("remote file not found")]
    NotFound,
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("all download tiers failed")]
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote_id: String,
    pub source_message_id: Option<i64>,
    pub declared_size: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    LocalCopy,
    Download,
    Reset,
    Retry,
    Refresh,
    HttpFallback,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Tier::LocalCopy => "local_copy",
            Tier::Download => "download",
            Tier::Reset => "reset",
            Tier::Retry => "retry",
            Tier::Refresh => "refresh",
            Tier::HttpFallback => "http_fallback",
        }
    }
}

/// 限流终止整个流程，其他错误进入下一层。
fn fall_through(remote_id: &str, tier: Tier, err: BackendError) -> Result<(), DownloadError> {
    if let BackendError::RateLimited { retry_after } = err {
        warn!(remote_id, tier = tier.as_str(), retry_after, "download rate limited");
        return Err(DownloadError::RateLimited { retry_after });
    }
    debug!(remote_id, tier = tier.as_str(), error = %err, "download tier failed");
    Ok(())
}

pub struct Downloader {
    backend: Arc<dyn RemoteBackend>,
    http_files: Option<Arc<HttpFileClient>>,
    cache: Arc<FileCache>,
    messages: Arc<MessageLifecycle>,
}

impl Downloader {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        http_files: Option<Arc<HttpFileClient>>,
        cache: Arc<FileCache>,
        messages: Arc<MessageLifecycle>,
    ) -> Self {
        Self {
            backend,
            http_files,
            cache,
            messages,
        }
    }

    async fn register(&self, remote_id: &str, path: &std::path::Path, tier: Tier) -> Option<CachedFile> {
        match self.cache.insert(remote_id, path).await {
            Ok(cached) => {
                info!(remote_id, tier = tier.as_str(), size = cached.size, "download resolved");
                Some(cached)
            }
            Err(err) => {
                warn!(remote_id, tier = tier.as_str(), error = %err, "resolved file is unreadable");
                None
            }
        }
    }

    async fn try_download(&self, remote_id: &str, tier: Tier) -> Result<Option<CachedFile>, DownloadError> {
        match self.backend.download(remote_id).await {
            Ok(path) => Ok(self.register(remote_id, &path, tier).await),
            Err(err) => fall_through(remote_id, tier, err).map(|_| None),
        }
    }

    /// 取得文件的本地路径并登记到缓存。
    pub async fn resolve(&self, request: &DownloadRequest) -> Result<CachedFile, DownloadError> {
        let remote_id = request.remote_id.as_str();
        validate_remote_id(remote_id)?;

        if let Some(hit) = self.cache.lookup(remote_id).await {
            debug!(remote_id, "download served from cache");
            return Ok(hit);
        }

        match self.backend.local_copy(remote_id).await {
            Ok(Some(path)) => {
                if let Some(cached) = self.register(remote_id, &path, Tier::LocalCopy).await {
                    return Ok(cached);
                }
            }
            Ok(None) => {}
            Err(err) => fall_through(remote_id, Tier::LocalCopy, err)?,
        }

        if let Some(cached) = self.try_download(remote_id, Tier::Download).await? {
            return Ok(cached);
        }

        if let Err(err) = self.backend.cancel_download(remote_id).await {
            fall_through(remote_id, Tier::Reset, err)?;
        }
        if let Err(err) = self.backend.reset_file_state(remote_id).await {
            fall_through(remote_id, Tier::Reset, err)?;
        }
        match self.backend.resolve(remote_id).await {
            Ok(_) => {}
            Err(BackendError::NotFound) if request.source_message_id.is_none() => {
                info!(remote_id, "remote file not found");
                return Err(DownloadError::NotFound);
            }
            Err(err) => fall_through(remote_id, Tier::Reset, err)?,
        }
        if let Some(cached) = self.try_download(remote_id, Tier::Retry).await? {
            return Ok(cached);
        }

        if let (Some(message_id), Some(http_files)) = (request.source_message_id, &self.http_files) {
            match self.messages.refresh_reference(message_id).await {
                Ok(refreshed) => {
                    let fetched = http_files.fetch(&refreshed.file.remote_id).await;
                    self.messages.discard_copy(refreshed.copy_message_id).await;
                    match fetched {
                        Ok(path) => {
                            if let Some(cached) = self.register(remote_id, &path, Tier::Refresh).await {
                                return Ok(cached);
                            }
                        }
                        Err(err) => fall_through(remote_id, Tier::Refresh, err)?,
                    }
                }
                Err(err) => fall_through(remote_id, Tier::Refresh, err)?,
            }
        }

        if let Some(http_files) = &self.http_files
            && request
                .declared_size
                .is_none_or(|size| size <= http_files.max_bytes())
        {
            match http_files.fetch(remote_id).await {
                Ok(path) => {
                    if let Some(cached) = self.register(remote_id, &path, Tier::HttpFallback).await {
                        return Ok(cached);
                    }
                }
                Err(err) => fall_through(remote_id, Tier::HttpFallback, err)?,
            }
        }

        warn!(remote_id, "all download tiers failed");
        Err(DownloadError::Exhausted)
    }
}

#[derive(Deserialize)]
pub(crate) struct SignedQuery {
    dl: Option<String>,
}

/// 签名链接下载：先校验令牌，再触发任何后端操作。
pub async fn download_signed(
    Path((token, _name)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
    headers: HeaderMap,
    Extension(signer): Extension<Arc<LinkSigner>>,
    Extension(downloader): Extension<Arc<Downloader>>,
) -> Result<Response, ApiError> {
    let verified = signer.verify(&token)?;
    let claims = verified.claims;
    let cached = downloader
        .resolve(&DownloadRequest {
            remote_id: claims.file_id.clone(),
            source_message_id: claims.message_id,
            declared_size: claims.size,
        })
        .await?;
    let options = ServeOptions {
        mime_type: claims.mime_type,
        file_name: claims.file_name,
        inline: query.dl.as_deref() != Some("1"),
    };
    serve_file(&cached.path, &options, &headers).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DownloadQuery {
    id: String,
    name: Option<String>,
    mime: Option<String>,
    inline: Option<bool>,
    message_id: Option<i64>,
    size: Option<u64>,
}

pub async fn download_file(
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
    Extension(downloader): Extension<Arc<Downloader>>,
) -> Result<Response, ApiError> {
    let cached = downloader
        .resolve(&DownloadRequest {
            remote_id: query.id.clone(),
            source_message_id: query.message_id,
            declared_size: query.size,
        })
        .await?;
    let file_name = query
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| query.id.clone());
    let mime_type = query
        .mime
        .filter(|mime| !mime.trim().is_empty())
        .unwrap_or_else(|| {
            mime_guess::from_path(&file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
    let options = ServeOptions {
        mime_type,
        file_name,
        inline: query.inline.unwrap_or(false),
    };
    serve_file(&cached.path, &options, &headers).await
}

#[derive(Deserialize)]
pub(crate) struct ThumbnailQuery {
    id: String,
}

pub async fn download_thumbnail(
    Query(query): Query<ThumbnailQuery>,
    headers: HeaderMap,
    Extension(downloader): Extension<Arc<Downloader>>,
) -> Result<Response, ApiError> {
    let cached = downloader
        .resolve(&DownloadRequest {
            remote_id: query.id.clone(),
            source_message_id: None,
            declared_size: None,
        })
        .await?;
    let options = ServeOptions {
        mime_type: "image/jpeg".into(),
        file_name: format!("{}.jpg", query.id),
        inline: true,
    };
    serve_file(&cached.path, &options, &headers).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignLinkBody {
    #[serde(flatten)]
    claims: LinkClaims,
    ttl_secs: Option<u64>,
}

/// 为可信调用方签发下载链接。
pub async fn sign_link(
    Extension(signer): Extension<Arc<LinkSigner>>,
    Json(body): Json<SignLinkBody>,
) -> Result<JsonResponse<IssuedLink>, ApiError> {
    validate_remote_id(&body.claims.file_id)
        .map_err(|err| ApiError::InvalidFormat(err.to_string()))?;
    if body.claims.file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("fileName is required".into()));
    }
    if let Some(ttl_secs) = body.ttl_secs
        && !(1..=MAX_LINK_TTL_SECS).contains(&ttl_secs)
    {
        return Err(ApiError::BadRequest(format!(
            "ttlSecs must be between 1 and {MAX_LINK_TTL_SECS}"
        )));
    }
    let link = signer.issue(&body.claims, body.ttl_secs.map(Duration::from_secs));
    debug!(file_id = body.claims.file_id, expires_at = %link.expires_at, "link signed");
    Ok(JsonResponse(link))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Call, ScriptedBackend};
    use crate::backend::{FileDescriptor, MessageContent, RemoteMessage};
    use crate::cache::CacheConfig;
    use crate::clock::SystemClock;
    use axum::Router;
    use axum::routing::{get, post};
    use crate::clock::testing::ManualClock;
    use axum::http::{HeaderValue, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct Fixture {
        temp: tempfile::TempDir,
        backend: Arc<ScriptedBackend>,
        cache: Arc<FileCache>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().expect("tempdir");
            let cache = Arc::new(FileCache::new(
                temp.path().join("scratch"),
                CacheConfig {
                    ttl: Duration::from_secs(3600),
                    max_app_bytes: u64::MAX,
                    max_entries: usize::MAX,
                },
                Arc::new(SystemClock),
            ));
            Self {
                temp,
                backend: Arc::new(ScriptedBackend::new()),
                cache,
            }
        }

        fn downloader(&self, http_files: Option<Arc<HttpFileClient>>) -> Downloader {
            Downloader::new(
                self.backend.clone(),
                http_files,
                self.cache.clone(),
                Arc::new(MessageLifecycle::new(self.backend.clone())),
            )
        }

        fn file(&self, name: &str, body: &[u8]) -> PathBuf {
            let path = self.temp.path().join(name);
            std::fs::write(&path, body).expect("write");
            path
        }
    }

    fn request(id: &str, message_id: Option<i64>) -> DownloadRequest {
        DownloadRequest {
            remote_id: id.to_string(),
            source_message_id: message_id,
            declared_size: None,
        }
    }

    #[tokio::test]
    async fn invalid_identifier_never_reaches_backend() {
        let fx = Fixture::new();
        let result = fx.downloader(None).resolve(&request("12345", None)).await;
        assert!(matches!(
            result,
            Err(DownloadError::InvalidIdentifier(RemoteIdError::NumericId))
        ));
        assert!(fx.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn local_copy_is_cached_for_next_request() {
        let fx = Fixture::new();
        let path = fx.file("local", b"abc");
        fx.backend
            .local_copies
            .lock()
            .expect("lock")
            .insert("BQlocal".into(), path.clone());
        let downloader = fx.downloader(None);

        let first = downloader.resolve(&request("BQlocal", None)).await.expect("first");
        let second = downloader.resolve(&request("BQlocal", None)).await.expect("second");
        assert_eq!(first.path, path);
        assert_eq!(second.path, path);
        assert_eq!(fx.backend.calls(), vec![Call::LocalCopy("BQlocal".into())]);
    }

    #[tokio::test]
    async fn reset_then_retry_after_failed_download() {
        let fx = Fixture::new();
        let path = fx.file("retried", b"abc");
        fx.backend
            .script_download(Err(BackendError::Other("stuck".into())));
        fx.backend.script_download(Ok(path.clone()));

        let cached = fx
            .downloader(None)
            .resolve(&request("BQretry", None))
            .await
            .expect("resolve");
        assert_eq!(cached.path, path);
        let id = || "BQretry".to_string();
        assert_eq!(
            fx.backend.calls(),
            vec![
                Call::LocalCopy(id()),
                Call::Download(id()),
                Call::Cancel(id()),
                Call::Reset(id()),
                Call::Resolve(id()),
                Call::Download(id()),
            ]
        );
    }

    #[tokio::test]
    async fn not_found_without_message_short_circuits() {
        let fx = Fixture::new();
        *fx.backend.resolve_result.lock().expect("lock") = Some(Err(BackendError::NotFound));
        let result = fx.downloader(None).resolve(&request("BQgone", None)).await;
        assert!(matches!(result, Err(DownloadError::NotFound)));
        assert_eq!(fx.backend.calls().last(), Some(&Call::Resolve("BQgone".into())));
    }

    #[tokio::test]
    async fn rate_limit_is_surfaced_immediately() {
        let fx = Fixture::new();
        fx.backend
            .script_download(Err(BackendError::RateLimited { retry_after: 9 }));
        let result = fx.downloader(None).resolve(&request("BQbusy", None)).await;
        assert!(matches!(
            result,
            Err(DownloadError::RateLimited { retry_after: 9 })
        ));
        assert_eq!(fx.backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_without_http_fallback() {
        let fx = Fixture::new();
        let result = fx.downloader(None).resolve(&request("BQnothing", Some(3))).await;
        assert!(matches!(result, Err(DownloadError::Exhausted)));
        assert!(!fx.backend.calls().contains(&Call::Forward(3)));
    }

    async fn spawn_bot_api() -> String {
        async fn get_file(Json(body): Json<Value>) -> JsonResponse<Value> {
            let file_id = body["file_id"].as_str().unwrap_or_default().to_string();
            if file_id == "BQfresh" {
                JsonResponse(json!({
                    "ok": true,
                    "result": { "file_id": file_id, "file_size": 11, "file_path": "f/fresh" }
                }))
            } else {
                JsonResponse(json!({
                    "ok": false,
                    "error_code": 400,
                    "description": "Bad Request: wrong file identifier/HTTP URL specified"
                }))
            }
        }
        let app = Router::new()
            .route("/botT/getFile", post(get_file))
            .route("/file/botT/f/fresh", get(|| async { "fresh bytes" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn refresh_tier_fetches_fresh_reference_and_discards_copy() {
        let fx = Fixture::new();
        *fx.backend.forward_result.lock().expect("lock") = Some(Ok(RemoteMessage {
            message_id: 777,
            content: MessageContent::Document {
                file: FileDescriptor {
                    remote_id: "BQfresh".into(),
                    internal_id: None,
                    size: Some(11),
                },
                thumbnail: None,
            },
        }));
        let base = spawn_bot_api().await;
        let http_files = Arc::new(HttpFileClient::new(
            reqwest::Client::new(),
            &base,
            "T",
            fx.temp.path().join("scratch"),
            1024,
        ));

        let downloader = fx.downloader(Some(http_files));
        let cached = downloader
            .resolve(&request("BQstale", Some(5)))
            .await
            .expect("resolve");
        assert_eq!(std::fs::read(&cached.path).expect("read"), b"fresh bytes");
        let calls = fx.backend.calls();
        assert!(calls.contains(&Call::Forward(5)));
        assert!(calls.contains(&Call::Delete(vec![777])));
        assert!(fx.cache.lookup("BQstale").await.is_some());
        assert_eq!(fx.cache.stats().await.app_managed_bytes, 11);
    }

    fn signer(clock: Arc<ManualClock>) -> Arc<LinkSigner> {
        Arc::new(LinkSigner::new(
            b"link-secret".to_vec(),
            Duration::from_secs(300),
            "http://localhost:5007",
            clock,
        ))
    }

    fn link_claims(file_id: &str) -> LinkClaims {
        LinkClaims {
            file_id: file_id.to_string(),
            message_id: None,
            mime_type: "text/plain".into(),
            file_name: "notes.txt".into(),
            size: Some(11),
        }
    }

    async fn signed(
        fx: &Fixture,
        signer: &Arc<LinkSigner>,
        token: &str,
        dl: Option<&str>,
    ) -> Result<Response, ApiError> {
        download_signed(
            Path((token.to_string(), "notes.txt".to_string())),
            Query(SignedQuery {
                dl: dl.map(str::to_string),
            }),
            HeaderMap::new(),
            Extension(signer.clone()),
            Extension(Arc::new(fx.downloader(None))),
        )
        .await
    }

    fn disposition(response: &Response) -> &str {
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn bad_or_expired_token_is_rejected_before_backend() {
        let fx = Fixture::new();
        let clock = Arc::new(ManualClock::new());
        let signer = signer(clock.clone());

        let result = signed(&fx, &signer, "bm90LWEtdG9rZW4.c2ln", None).await;
        assert!(matches!(result, Err(ApiError::InvalidLink)));

        let link = signer.issue(&link_claims("BQsigned"), None);
        let mut tampered = link.token.clone().into_bytes();
        tampered[2] = if tampered[2] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).expect("ascii");
        let result = signed(&fx, &signer, &tampered, None).await;
        assert!(matches!(result, Err(ApiError::InvalidLink)));

        clock.advance(Duration::from_secs(301));
        let result = signed(&fx, &signer, &link.token, None).await;
        assert!(matches!(result, Err(ApiError::InvalidLink)));

        assert!(fx.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn signed_link_is_inline_unless_dl_is_set() {
        let fx = Fixture::new();
        let path = fx.file("notes", b"hello world");
        fx.backend
            .local_copies
            .lock()
            .expect("lock")
            .insert("BQsigned".into(), path);
        let signer = signer(Arc::new(ManualClock::new()));
        let link = signer.issue(&link_claims("BQsigned"), None);

        let response = signed(&fx, &signer, &link.token, None).await.expect("inline");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(disposition(&response).starts_with("inline;"));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("text/plain")
        );

        let response = signed(&fx, &signer, &link.token, Some("1"))
            .await
            .expect("attachment");
        assert!(disposition(&response).starts_with("attachment;"));
    }

    #[tokio::test]
    async fn trusted_download_serves_range_from_cache() {
        let fx = Fixture::new();
        let path = fx.file("cached", b"0123456789");
        fx.cache.insert("BQcached", &path).await.expect("insert");
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-4"));

        let response = download_file(
            Query(DownloadQuery {
                id: "BQcached".into(),
                name: Some("digits.txt".into()),
                mime: None,
                inline: None,
                message_id: None,
                size: None,
            }),
            headers,
            Extension(Arc::new(fx.downloader(None))),
        )
        .await
        .expect("response");

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).and_then(|v| v.to_str().ok()),
            Some("bytes 2-4/10")
        );
        assert!(disposition(&response).starts_with("attachment;"));
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"234");
        assert!(fx.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn sign_link_rejects_out_of_range_ttl() {
        let signer = signer(Arc::new(ManualClock::new()));
        let body = |ttl: u64| -> SignLinkBody {
            serde_json::from_value(json!({
                "fileId": "BQsigned",
                "mimeType": "text/plain",
                "fileName": "notes.txt",
                "ttlSecs": ttl,
            }))
            .expect("body")
        };

        let result = sign_link(Extension(signer.clone()), Json(body(u64::MAX))).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        let result = sign_link(Extension(signer.clone()), Json(body(0))).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let JsonResponse(link) = sign_link(Extension(signer.clone()), Json(body(60)))
            .await
            .expect("signed");
        assert!(link.url.ends_with("/notes%2Etxt"));
        assert!(signer.verify(&link.token).is_ok());
    }
}
