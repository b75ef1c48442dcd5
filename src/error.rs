//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::error;

use crate::backend::BackendError;
use crate::download::DownloadError;
use crate::sender::SendError;
use crate::token::TokenError;
use crate::upload::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    NotFound(String),
    InvalidFormat(String),
    InvalidLink,
    Unauthorized,
    Conflict(String),
    TooManyRequests(u64),
    UploadStalled,
    UploadTimeout,
    DownloadFailed,
    RangeNotSatisfiable(u64),
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::PayloadTooLarge(_) => "payload_too_large",
            ApiError::NotFound(_) => "not_found",
            ApiError::InvalidFormat(_) => "invalid_format",
            ApiError::InvalidLink => "invalid_link",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Conflict(_) => "conflict",
            ApiError::TooManyRequests(_) => "rate_limited",
            ApiError::UploadStalled => "upload_stalled",
            ApiError::UploadTimeout => "upload_timeout",
            ApiError::DownloadFailed => "download_failed",
            ApiError::RangeNotSatisfiable(_) => "range_not_satisfiable",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidLink | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UploadStalled | ApiError::UploadTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::DownloadFailed => StatusCode::BAD_GATEWAY,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::NotFound(msg)
            | ApiError::InvalidFormat(msg)
            | ApiError::Conflict(msg) => msg.clone(),
            ApiError::InvalidLink => "link is invalid or expired".into(),
            ApiError::Unauthorized => "unauthorized".into(),
            ApiError::TooManyRequests(_) => "too many requests".into(),
            ApiError::UploadStalled => "upload stalled".into(),
            ApiError::UploadTimeout => "upload timed out".into(),
            ApiError::DownloadFailed => "download failed".into(),
            ApiError::RangeNotSatisfiable(_) => "range not satisfiable".into(),
            ApiError::Internal(_) => "internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        match &self {
            ApiError::Internal(detail) => {
                error!(error = %detail, "internal error");
            }
            ApiError::RangeNotSatisfiable(size) => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            ApiError::TooManyRequests(retry_after) => {
                if *retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
            }
            ApiError::Unauthorized => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }
        let body = json!({ "code": self.code(), "message": self.message() });
        (self.status(), headers, Json(body)).into_response()
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<BackendError> for ApiError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::NotFound => ApiError::NotFound("remote file not found".into()),
            BackendError::RateLimited { retry_after } => ApiError::TooManyRequests(retry_after),
            BackendError::TooLarge { .. } => ApiError::PayloadTooLarge(error.to_string()),
            BackendError::Rejected(_) | BackendError::Other(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl From<SendError> for ApiError {
    fn from(error: SendError) -> Self {
        match error {
            SendError::HardTimeout(_) => ApiError::UploadTimeout,
            SendError::Stalled(_) => ApiError::UploadStalled,
            SendError::Backend(err) => err.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::MissingField(_)
            | UploadError::TooManyChunks { .. }
            | UploadError::ChunkOutOfRange { .. }
            | UploadError::MissingChunks { .. }
            | UploadError::EmptyFile
            | UploadError::SizeMismatch { .. } => ApiError::BadRequest(error.to_string()),
            UploadError::TooLarge { .. } | UploadError::ChunkTooLarge { .. } => {
                ApiError::PayloadTooLarge(error.to_string())
            }
            UploadError::SessionNotFound => ApiError::NotFound(error.to_string()),
            UploadError::Finalizing => ApiError::Conflict(error.to_string()),
            UploadError::Body(_) | UploadError::Io(_) => ApiError::Internal(error.to_string()),
            UploadError::Send(err) => err.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::InvalidIdentifier(err) => ApiError::InvalidFormat(err.to_string()),
            DownloadError::NotFound => ApiError::NotFound("remote file not found".into()),
            DownloadError::RateLimited { retry_after } => ApiError::TooManyRequests(retry_after),
            DownloadError::Exhausted => ApiError::DownloadFailed,
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(_: TokenError) -> Self {
        ApiError::InvalidLink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let response = ApiError::from(BackendError::RateLimited { retry_after: 17 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("17")
        );
        assert_eq!(body_json(response).await["code"], "rate_limited");
    }

    #[tokio::test]
    async fn internal_detail_does_not_leak() {
        let response = ApiError::Internal("tier 3 exploded at /secret/path".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "internal error");
    }

    #[test]
    fn timeouts_are_distinguishable() {
        let hard = ApiError::from(SendError::HardTimeout(std::time::Duration::from_secs(60)));
        let stalled = ApiError::from(SendError::Stalled(std::time::Duration::from_secs(10)));
        assert_eq!(hard.status(), stalled.status());
        assert_ne!(hard.code(), stalled.code());
    }
}
