//! 签名下载链接：HMAC-SHA256 令牌的签发与校验。

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::clock::{Clock, unix_secs};
use crate::config::MAX_LINK_TTL_SECS;

type HmacSha256 = Hmac<Sha256>;

/// 链接授权的文件信息，签名后原样信任。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkClaims {
    pub file_id: String,
    #[serde(default)]
    pub message_id: Option<i64>,
    pub mime_type: String,
    pub file_name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct WirePayload {
    #[serde(rename = "f")]
    file_id: String,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    message_id: Option<i64>,
    #[serde(rename = "t")]
    mime_type: String,
    #[serde(rename = "n")]
    file_name: String,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(rename = "e")]
    exp: u64,
}

/// 校验通过的令牌内容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedLink {
    pub claims: LinkClaims,
    pub expires_at: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// 以 `now + ttl` 为绝对过期时间编码并签名。
///
/// 格式为 `base64url(json).base64url(hmac)`，均不带填充。
pub fn issue(claims: &LinkClaims, secret: &[u8], ttl: Duration, now: SystemTime) -> String {
    let payload = WirePayload {
        file_id: claims.file_id.clone(),
        message_id: claims.message_id,
        mime_type: claims.mime_type.clone(),
        file_name: claims.file_name.clone(),
        size: claims.size,
        exp: expiry_secs(now, ttl),
    };
    // 仅包含字符串与整数字段，序列化不会失败。
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    let encoded = URL_SAFE_NO_PAD.encode(json);
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, encoded.as_bytes()));
    format!("{encoded}.{signature}")
}

/// 溢出时取最大值，令牌视为永不过期而非 panic。
fn expiry_secs(now: SystemTime, ttl: Duration) -> u64 {
    now.checked_add(ttl).map(unix_secs).unwrap_or(u64::MAX)
}

/// 校验签名与过期时间，返回可信内容。
pub fn verify(token: &str, secret: &[u8], now: SystemTime) -> Result<VerifiedLink, TokenError> {
    let (encoded, signature) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
    if encoded.is_empty() || signature.is_empty() {
        return Err(TokenError::Malformed);
    }
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::BadSignature)?;
    mac.update(encoded.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::BadSignature)?;

    let json = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| TokenError::Malformed)?;
    let payload: WirePayload = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;
    if payload.exp <= unix_secs(now) {
        return Err(TokenError::Expired);
    }

    Ok(VerifiedLink {
        claims: LinkClaims {
            file_id: payload.file_id,
            message_id: payload.message_id,
            mime_type: payload.mime_type,
            file_name: payload.file_name,
            size: payload.size,
        },
        expires_at: payload.exp,
    })
}

fn sign(secret: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC 接受任意长度密钥。
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// 签发链接所需的密钥、默认有效期与对外地址。
#[derive(Debug)]
pub struct LinkSigner {
    secret: Vec<u8>,
    ttl: Duration,
    public_url: String,
    clock: Arc<dyn Clock>,
}

/// 已签发的链接。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedLink {
    pub token: String,
    pub url: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl LinkSigner {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration, public_url: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            ttl: ttl.min(Duration::from_secs(MAX_LINK_TTL_SECS)),
            public_url: public_url.trim_end_matches('/').to_string(),
            clock,
        }
    }

    pub fn issue(&self, claims: &LinkClaims, ttl: Option<Duration>) -> IssuedLink {
        let now = self.clock.now();
        let ttl = ttl
            .unwrap_or(self.ttl)
            .min(Duration::from_secs(MAX_LINK_TTL_SECS));
        let token = issue(claims, &self.secret, ttl, now);
        let name = percent_encoding::utf8_percent_encode(
            &claims.file_name,
            percent_encoding::NON_ALPHANUMERIC,
        );
        let url = format!("{}/d/{}/{}", self.public_url, token, name);
        let expires_at = UNIX_EPOCH + Duration::from_secs(expiry_secs(now, ttl));
        IssuedLink {
            token,
            url,
            expires_at: expires_at.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedLink, TokenError> {
        verify(token, &self.secret, self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;

    fn claims() -> LinkClaims {
        LinkClaims {
            file_id: "BQACAgIAAxkBAAIBZ2Vh".to_string(),
            message_id: Some(42),
            mime_type: "video/mp4".to_string(),
            file_name: "holiday clip.mp4".to_string(),
            size: Some(1_048_576),
        }
    }

    #[test]
    fn verify_returns_original_claims_before_expiry() {
        let now = SystemTime::now();
        let token = issue(&claims(), b"secret", Duration::from_secs(60), now);
        let verified = verify(&token, b"secret", now + Duration::from_secs(59)).expect("valid");
        assert_eq!(verified.claims, claims());
    }

    #[test]
    fn tampered_payload_byte_fails_signature() {
        let now = SystemTime::now();
        let token = issue(&claims(), b"secret", Duration::from_secs(60), now);
        let mut bytes = token.into_bytes();
        bytes[3] = if bytes[3] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).expect("ascii");
        assert_eq!(
            verify(&tampered, b"secret", now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let now = SystemTime::now();
        let token = issue(&claims(), b"secret", Duration::from_secs(60), now);
        assert_eq!(
            verify(&token, b"other", now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn expired_token_fails_even_with_valid_signature() {
        let now = SystemTime::now();
        let token = issue(&claims(), b"secret", Duration::from_secs(60), now);
        assert_eq!(
            verify(&token, b"secret", now + Duration::from_secs(61)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let now = SystemTime::now();
        assert_eq!(verify("no-dot-here", b"secret", now), Err(TokenError::Malformed));
        assert_eq!(verify("abc.!!!", b"secret", now), Err(TokenError::Malformed));
    }

    #[test]
    fn signer_builds_url_with_encoded_name() {
        let clock = Arc::new(ManualClock::new());
        let signer = LinkSigner::new(
            b"secret".to_vec(),
            Duration::from_secs(300),
            "https://files.example.com/",
            clock.clone(),
        );
        let link = signer.issue(&claims(), None);
        assert!(link.url.starts_with("https://files.example.com/d/"));
        assert!(link.url.ends_with("/holiday%20clip%2Emp4"));
        assert!(signer.verify(&link.token).is_ok());

        clock.advance(Duration::from_secs(301));
        assert_eq!(signer.verify(&link.token), Err(TokenError::Expired));
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let now = SystemTime::now();
        let token = issue(&claims(), b"secret", Duration::from_secs(u64::MAX), now);
        let verified = verify(&token, b"secret", now).expect("valid");
        assert_eq!(verified.expires_at, u64::MAX);

        let clock = Arc::new(ManualClock::new());
        let signer = LinkSigner::new(
            b"secret".to_vec(),
            Duration::from_secs(u64::MAX),
            "https://files.example.com",
            clock.clone(),
        );
        let link = signer.issue(&claims(), Some(Duration::from_secs(u64::MAX)));
        let verified = signer.verify(&link.token).expect("valid");
        assert_eq!(
            verified.expires_at,
            unix_secs(clock.now()) + MAX_LINK_TTL_SECS
        );
    }
}
