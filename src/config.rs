//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const UPLOAD_TEMP_DIR: &str = "uploads";
pub const SCRATCH_DIR: &str = "scratch";
pub const BACKEND_STORE_DIR: &str = "backend";
pub const HTTP_FILE_MAX_BYTES: u64 = 20 * 1024 * 1024;
pub const REPAIR_MAX_ITEMS: usize = 100;
pub const UPLOAD_REAP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SEND_CONCURRENCY: usize = 3;
pub const DEFAULT_SEND_IDLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SEND_MIN_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SEND_MAX_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_SEND_MIN_THROUGHPUT: u64 = 256 * 1024;
pub const DEFAULT_PHOTO_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 2000 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_UPLOAD_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_LINK_TTL_SECS: u64 = 60 * 60;
pub const MAX_LINK_TTL_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_BOT_API_URL: &str = "https://api.telegram.org";

/// 远端后端实现。
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Files kept under the data directory (development).
    Local,
    /// Messaging platform Bot API over HTTP.
    BotApi,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-vault", version = VERSION_INFO, about = "AxoVault storage proxy")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/vault",
        help = "Data directory for upload staging, scratch downloads and the local backend"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 5007,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(short = 'P', long, env = "AXO_HTTPS_PORT", help = "HTTPS port (disabled when unset)")]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_API_KEY",
        help = "Shared key required on /api routes (unset disables the check)"
    )]
    pub api_key: Option<String>,
    #[arg(long, env = "AXO_LINK_SECRET", help = "HMAC secret for signed download links")]
    pub link_secret: String,
    #[arg(
        long,
        env = "AXO_LINK_TTL_SECS",
        default_value_t = DEFAULT_LINK_TTL_SECS,
        help = "Default signed link lifetime in seconds"
    )]
    pub link_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_PUBLIC_URL",
        default_value = "",
        help = "Public base URL used when building signed links"
    )]
    pub public_url: String,
    #[arg(
        long,
        env = "AXO_BACKEND",
        value_enum,
        default_value_t = BackendKind::Local,
        help = "Remote backend implementation"
    )]
    pub backend: BackendKind,
    #[arg(long, env = "AXO_BOT_TOKEN", help = "Bot API token")]
    pub bot_token: Option<String>,
    #[arg(
        long,
        env = "AXO_BOT_API_URL",
        default_value = DEFAULT_BOT_API_URL,
        help = "Bot API base URL"
    )]
    pub bot_api_url: String,
    #[arg(long, env = "AXO_CHAT_ID", help = "Chat that stores uploaded files")]
    pub chat_id: Option<i64>,
    #[arg(
        long,
        env = "AXO_SEND_CONCURRENCY",
        default_value_t = DEFAULT_SEND_CONCURRENCY,
        help = "Max concurrent sends to the backend"
    )]
    pub send_concurrency: usize,
    #[arg(
        long,
        env = "AXO_SEND_IDLE_TIMEOUT_SECS",
        default_value_t = DEFAULT_SEND_IDLE_TIMEOUT_SECS,
        help = "Fail a send when no progress is seen for this long"
    )]
    pub send_idle_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_SEND_MIN_TIMEOUT_SECS",
        default_value_t = DEFAULT_SEND_MIN_TIMEOUT_SECS,
        help = "Lower bound of the size-scaled send timeout"
    )]
    pub send_min_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_SEND_MAX_TIMEOUT_SECS",
        default_value_t = DEFAULT_SEND_MAX_TIMEOUT_SECS,
        help = "Upper bound of the size-scaled send timeout"
    )]
    pub send_max_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_SEND_MIN_THROUGHPUT",
        default_value_t = DEFAULT_SEND_MIN_THROUGHPUT,
        help = "Assumed worst-case throughput in bytes/s used to scale the send timeout"
    )]
    pub send_min_throughput: u64,
    #[arg(
        long,
        env = "AXO_PHOTO_MAX_BYTES",
        default_value_t = DEFAULT_PHOTO_MAX_BYTES,
        help = "Images above this size are sent as documents"
    )]
    pub photo_max_bytes: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload total size in bytes"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_SESSION_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_SESSION_TTL_SECS,
        help = "Chunked sessions older than this are reaped"
    )]
    pub upload_session_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_CACHE_TTL_SECS",
        default_value_t = DEFAULT_CACHE_TTL_SECS,
        help = "Evict scratch downloads untouched for this long"
    )]
    pub cache_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_CACHE_MAX_BYTES",
        default_value_t = DEFAULT_CACHE_MAX_BYTES,
        help = "Cap on total bytes of scratch downloads"
    )]
    pub cache_max_bytes: u64,
    #[arg(
        long,
        env = "AXO_CACHE_MAX_ENTRIES",
        default_value_t = DEFAULT_CACHE_MAX_ENTRIES,
        help = "Cap on cache index entries"
    )]
    pub cache_max_entries: usize,
    #[arg(
        long,
        env = "AXO_CACHE_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_CACHE_SWEEP_INTERVAL_SECS,
        help = "Cache sweep interval in seconds"
    )]
    pub cache_sweep_interval_secs: u64,
    #[arg(
        long,
        env = "AXO_LOG_FILTER",
        default_value = "info",
        help = "Log filter used when RUST_LOG is unset"
    )]
    pub log_filter: String,
}
