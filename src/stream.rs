//! 将本地文件作为 HTTP 响应流出：Range、If-Range、Content-Disposition。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use httpdate::{fmt_http_date, parse_http_date};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;

/// RFC 5987 attr-char 之外的字符需要编码。
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// 响应呈现方式。
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub mime_type: String,
    pub file_name: String,
    pub inline: bool,
}

/// 生成 `inline`/`attachment`，带 ASCII 兜底文件名与 UTF-8 `filename*`。
pub fn content_disposition(file_name: &str, inline: bool) -> String {
    let disposition = if inline { "inline" } else { "attachment" };
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let fallback = if fallback.trim().is_empty() {
        "download".to_string()
    } else {
        fallback
    };
    format!(
        "{disposition}; filename=\"{fallback}\"; filename*=UTF-8''{}",
        utf8_percent_encode(file_name, ATTR_CHAR)
    )
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}

/// 响应流提前释放时记录中断的传输。
struct TransferGuard<F: FnOnce(u64, u64)> {
    expected: u64,
    sent: u64,
    on_abort: Option<F>,
}

impl<F: FnOnce(u64, u64)> TransferGuard<F> {
    fn record(&mut self, bytes: usize) {
        self.sent += bytes as u64;
    }
}

impl<F: FnOnce(u64, u64)> Drop for TransferGuard<F> {
    fn drop(&mut self) {
        if self.sent < self.expected
            && let Some(on_abort) = self.on_abort.take()
        {
            on_abort(self.sent, self.expected);
        }
    }
}

fn guarded_body<R, F>(reader: R, expected: u64, on_abort: F) -> AxumBody
where
    R: tokio::io::AsyncRead + Send + 'static,
    F: FnOnce(u64, u64) + Send + 'static,
{
    let mut guard = TransferGuard {
        expected,
        sent: 0,
        on_abort: Some(on_abort),
    };
    let stream = ReaderStream::new(reader).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            guard.record(bytes.len());
        }
        chunk
    });
    AxumBody::from_stream(stream)
}

fn log_disconnect(file_name: &str) -> impl FnOnce(u64, u64) + Send + 'static {
    let file_name = file_name.to_string();
    move |sent, expected| {
        debug!(file_name, sent, expected, "client disconnected during download");
    }
}

/// 输出文件内容，支持单段 Range 与 If-Range。
pub async fn serve_file(
    path: &Path,
    options: &ServeOptions,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let metadata = fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(ApiError::NotFound("file not found".into()));
    }
    let file_size = metadata.len();
    let modified = metadata.modified().ok();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, header_value(&options.mime_type)?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&options.file_name, options.inline))?,
    );
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = File::open(path).await?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(file_name = options.file_name, start, end, length, "range request accepted");
        file.seek(SeekFrom::Start(start)).await?;
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{file_size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        let body = guarded_body(file.take(length), length, log_disconnect(&options.file_name));
        return Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string())?);
    info!(file_name = options.file_name, size = file_size, "serving full file");
    let body = guarded_body(file, file_size, log_disconnect(&options.file_name));
    Ok((StatusCode::OK, response_headers, body).into_response())
}

/// 解析 Range 头，返回可读取的闭区间。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range
        .split_once('-')
        .ok_or_else(|| ApiError::BadRequest("invalid Range header".into()))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<u64>()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))
    };

    let (start, end) = if start_part.trim().is_empty() {
        let suffix = parse(end_part)?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start = parse(start_part)?;
        let end = if end_part.trim().is_empty() {
            file_size - 1
        } else {
            parse(end_part)?.min(file_size - 1)
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn options() -> ServeOptions {
        ServeOptions {
            mime_type: "application/octet-stream".into(),
            file_name: "报告 final.pdf".into(),
            inline: false,
        }
    }

    fn range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(value).expect("header"));
        headers
    }

    fn fixture() -> (tempfile::TempDir, std::path::PathBuf, Vec<u8>) {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("blob");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).expect("write");
        (temp, path, data)
    }

    #[tokio::test]
    async fn serves_requested_byte_range() {
        let (_temp, path, data) = fixture();
        let response = serve_file(&path, &options(), &range("bytes=100-199"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).and_then(|v| v.to_str().ok()),
            Some("bytes 100-199/1000")
        );
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.len(), 100);
        assert_eq!(&body[..], &data[100..200]);
    }

    #[tokio::test]
    async fn out_of_bounds_range_is_unsatisfiable() {
        let (_temp, path, _) = fixture();
        let result = serve_file(&path, &options(), &range("bytes=1000-1100")).await;
        assert!(matches!(result, Err(ApiError::RangeNotSatisfiable(1000))));
    }

    #[tokio::test]
    async fn full_response_carries_disposition() {
        let (_temp, path, _) = fixture();
        let response = serve_file(&path, &options(), &HeaderMap::new())
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .expect("disposition");
        assert!(disposition.starts_with("attachment; filename=\"__ final.pdf\""));
        assert!(disposition.ends_with("filename*=UTF-8''%E6%8A%A5%E5%91%8A%20final.pdf"));
    }

    #[test]
    fn suffix_and_open_ranges() {
        let header = HeaderValue::from_static("bytes=-100");
        assert_eq!(parse_range(Some(&header), 1000).expect("range"), Some((900, 999)));
        let header = HeaderValue::from_static("bytes=990-");
        assert_eq!(parse_range(Some(&header), 1000).expect("range"), Some((990, 999)));
        let header = HeaderValue::from_static("bytes=0-1,5-6");
        assert!(matches!(parse_range(Some(&header), 1000), Err(ApiError::BadRequest(_))));
    }

    fn abort_flag() -> (Arc<AtomicBool>, impl FnOnce(u64, u64) + Send + 'static) {
        let flag = Arc::new(AtomicBool::new(false));
        let hook = {
            let flag = flag.clone();
            move |_sent: u64, _expected: u64| flag.store(true, Ordering::SeqCst)
        };
        (flag, hook)
    }

    #[tokio::test]
    async fn completed_transfer_does_not_report_disconnect() {
        let data = vec![7u8; 100_000];
        let (aborted, hook) = abort_flag();
        let body = guarded_body(std::io::Cursor::new(data.clone()), data.len() as u64, hook);
        let collected = body.collect().await.expect("body").to_bytes();
        assert_eq!(collected.len(), data.len());
        assert!(!aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn early_drop_reports_disconnect() {
        let data = vec![7u8; 100_000];
        let (aborted, hook) = abort_flag();
        let mut body = guarded_body(std::io::Cursor::new(data.clone()), data.len() as u64, hook);
        let first = body.frame().await.expect("frame").expect("data");
        assert!(first.data_ref().is_some_and(|bytes| bytes.len() < data.len()));
        assert!(!aborted.load(Ordering::SeqCst));
        drop(body);
        assert!(aborted.load(Ordering::SeqCst));
    }
}
