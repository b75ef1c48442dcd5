//! 共享密钥认证：`/api` 路由要求 Bearer 或 `X-Api-Key`。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::{middleware, response::Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiError;
use crate::http::resolve_client_ip;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    key: Option<String>,
}

impl ApiKeyConfig {
    /// 空字符串视为未配置。
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    fn accepts(&self, presented: &str) -> bool {
        match &self.key {
            Some(key) => keys_match(key.as_bytes(), presented.as_bytes()),
            None => true,
        }
    }
}

fn keys_match(expected: &[u8], presented: &[u8]) -> bool {
    expected.len() == presented.len()
        && expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn is_key_exempt_path(path: &str) -> bool {
    if path == "/api/version" || path == "/api/health" {
        return true;
    }
    !path.starts_with("/api/")
}

/// 认证中间件：签名链接 `/d/*` 由令牌自身鉴权，不经过此处校验。
pub async fn api_key_middleware(
    Extension(config): Extension<Arc<ApiKeyConfig>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if !config.is_enabled() || is_key_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if let Some(TypedHeader(Authorization(bearer))) = &bearer
        && config.accepts(bearer.token())
    {
        return Ok(next.run(req).await);
    }
    if let Some(value) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        && config.accepts(value.trim())
    {
        return Ok(next.run(req).await);
    }

    let connect_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = resolve_client_ip(req.headers(), connect_ip)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    warn!(client_ip, path = req.uri().path(), "rejected request without valid api key");
    Err(ApiError::Unauthorized)
}
