//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::config::Args;

const TLS_DIR: &str = "tls";

/// 构建 Rustls 配置；未提供证书时在数据目录下生成自签名证书。
pub async fn build_rustls_config(
    args: &Args,
    host: IpAddr,
    data_dir: &Path,
) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        (PathBuf::from(cert), PathBuf::from(key))
    } else {
        generate_self_signed(host, &data_dir.join(TLS_DIR)).await?
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

async fn generate_self_signed(host: IpAddr, dir: &Path) -> io::Result<(PathBuf, PathBuf)> {
    let cert = generate_simple_self_signed([host.to_string(), "localhost".to_string()])
        .map_err(|err| io::Error::other(err.to_string()))?;
    fs::create_dir_all(dir).await?;
    let cert_path = dir.join("self-signed-cert.pem");
    let key_path = dir.join("self-signed-key.pem");
    fs::write(&cert_path, cert.cert.pem()).await?;
    fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    info!(path = ?cert_path, "generated self-signed cert");
    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[tokio::test]
    async fn self_signed_pair_is_written_under_data_dir() {
        let temp = tempdir().expect("tempdir");
        let (cert, key) = generate_self_signed(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &temp.path().join(TLS_DIR),
        )
        .await
        .expect("generate");
        let cert = std::fs::read_to_string(cert).expect("cert");
        let key = std::fs::read_to_string(key).expect("key");
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }
}
