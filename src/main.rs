//! AxoVault server binary.
//!
//! Stores files as messages on a chat-based messaging platform and serves
//! them back over HTTP: chunked uploads are assembled locally and handed to
//! the backend through a bounded send gate, downloads resolve through a
//! tiered pipeline into an app-managed cache, and signed links expose single
//! files without sharing the API key.

mod atomic;
mod auth;
mod background;
mod backend;
mod bot_api;
mod cache;
mod clock;
mod config;
mod download;
mod error;
mod gate;
mod http;
mod http_file;
mod local_backend;
mod logging;
mod messages;
mod sender;
mod storage;
mod stream;
mod tls;
mod token;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, patch, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::ApiKeyConfig;
use crate::background::spawn_background_tasks;
use crate::backend::RemoteBackend;
use crate::bot_api::BotApiBackend;
use crate::cache::{CacheConfig, FileCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{Args, BackendKind, HTTP_FILE_MAX_BYTES};
use crate::download::Downloader;
use crate::gate::SendGate;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::http_file::HttpFileClient;
use crate::local_backend::LocalBackend;
use crate::messages::MessageLifecycle;
use crate::sender::{MediaSender, SendPolicy};
use crate::storage::Storage;
use crate::token::LinkSigner;
use crate::upload::{UploadConfig, UploadSessions};

shadow!(build);

fn invalid_input(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

/// 根据配置构建远端后端；Bot API 模式同时返回 HTTP 文件客户端。
fn build_backend(
    args: &Args,
    storage: &Storage,
) -> io::Result<(Arc<dyn RemoteBackend>, Option<Arc<HttpFileClient>>)> {
    match args.backend {
        BackendKind::Local => Ok((Arc::new(LocalBackend::new(&storage.backend_root())), None)),
        BackendKind::BotApi => {
            let token = args
                .bot_token
                .as_deref()
                .filter(|token| !token.trim().is_empty())
                .ok_or_else(|| invalid_input("--bot-token is required for the bot-api backend"))?;
            let chat_id = args
                .chat_id
                .ok_or_else(|| invalid_input("--chat-id is required for the bot-api backend"))?;
            let client = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(15))
                .build()
                .map_err(|err| io::Error::other(err.without_url().to_string()))?;
            let files = Arc::new(HttpFileClient::new(
                client.clone(),
                &args.bot_api_url,
                token,
                storage.scratch_root(),
                HTTP_FILE_MAX_BYTES,
            ));
            let backend = BotApiBackend::new(client, files.clone(), chat_id);
            Ok((Arc::new(backend), Some(files)))
        }
    }
}

/// Starts the AxoVault server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_filter);

    if args.link_secret.trim().is_empty() {
        return Err(invalid_input("--link-secret must not be empty"));
    }
    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| invalid_input(err.to_string()))?;

    let storage = Storage::new(PathBuf::from(&args.storage_dir));
    storage.ensure_layout().await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (backend, http_files) = build_backend(&args, &storage)?;
    info!(backend = backend.name(), "remote backend ready");

    let sender = Arc::new(MediaSender::new(
        backend.clone(),
        SendGate::new(args.send_concurrency.max(1)),
        SendPolicy {
            photo_max_bytes: args.photo_max_bytes,
            idle_timeout: Duration::from_secs(args.send_idle_timeout_secs),
            min_timeout: Duration::from_secs(args.send_min_timeout_secs),
            max_timeout: Duration::from_secs(args.send_max_timeout_secs),
            min_throughput: args.send_min_throughput.max(1),
        },
    ));
    let sessions = Arc::new(UploadSessions::new(
        storage.upload_root(),
        UploadConfig {
            max_file_size: args.upload_max_size,
            max_chunks: args.upload_max_chunks,
            session_ttl: Duration::from_secs(args.upload_session_ttl_secs),
        },
        clock.clone(),
    ));
    let cache = Arc::new(FileCache::new(
        storage.scratch_root(),
        CacheConfig {
            ttl: Duration::from_secs(args.cache_ttl_secs),
            max_app_bytes: args.cache_max_bytes,
            max_entries: args.cache_max_entries,
        },
        clock.clone(),
    ));
    let lifecycle = Arc::new(MessageLifecycle::new(backend.clone()));
    let downloader = Arc::new(Downloader::new(
        backend.clone(),
        http_files,
        cache.clone(),
        lifecycle.clone(),
    ));
    let public_url = if args.public_url.trim().is_empty() {
        format!("http://{}", SocketAddr::new(host, args.http_port))
    } else {
        args.public_url.clone()
    };
    let signer = Arc::new(LinkSigner::new(
        args.link_secret.clone().into_bytes(),
        Duration::from_secs(args.link_ttl_secs),
        &public_url,
        clock.clone(),
    ));
    let api_key = Arc::new(ApiKeyConfig::new(args.api_key.clone()));
    if !api_key.is_enabled() {
        warn!("no api key configured, /api routes are open");
    }

    let mut app = Router::new()
        .route("/d/{token}/{name}", get(download::download_signed))
        .route("/api/links", post(download::sign_link))
        .route("/api/files/download", get(download::download_file))
        .route("/api/files/thumbnail", get(download::download_thumbnail))
        .route(
            "/api/files/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files/repair", post(messages::repair_files))
        .route("/api/upload/init", post(upload::init_upload))
        .route(
            "/api/upload/chunk",
            patch(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/status", get(upload::upload_status))
        .route("/api/upload/complete", post(upload::complete_upload))
        .route("/api/upload/abort", post(upload::abort_upload))
        .route("/api/messages/cleanup", post(messages::cleanup_messages))
        .route("/api/messages/{id}", delete(messages::delete_message))
        .route("/api/version", get(version::get_version_info))
        .route("/api/health", get(version::get_health))
        .layer(middleware::from_fn(auth::api_key_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(sessions.clone()))
        .layer(Extension(sender))
        .layer(Extension(downloader))
        .layer(Extension(signer))
        .layer(Extension(lifecycle))
        .layer(Extension(cache.clone()))
        .layer(Extension(api_key));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    spawn_background_tasks(
        cache,
        sessions,
        Duration::from_secs(args.cache_sweep_interval_secs),
    );

    let handle = Handle::new();
    let http_addr = SocketAddr::new(host, args.http_port);
    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    match args.https_port {
        Some(https_port) => {
            let tls_config = tls::build_rustls_config(&args, host, storage.root_path()).await?;
            let https_addr = SocketAddr::new(host, https_port);
            info!("🔒 Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
