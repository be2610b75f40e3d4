//! fileshare server binary.
//!
//! Wires together the HTTP/JSON API, the HLS streamer, the FTP server, and
//! the optional proxy-protocol bridge around one shared directory. The
//! main entry point builds the Axum router, starts the listeners, and
//! owns graceful shutdown.

mod atomic;
mod auth;
mod blocklist;
mod bridge;
mod config;
mod disk;
mod error;
mod fileio;
mod frontend;
mod ftp;
mod http;
mod mime;
mod pathguard;
mod ratelimit;
mod settings;
mod speedtest;
mod stats;
mod streamer;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use clap::Parser;
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::Auth;
use crate::blocklist::BlockList;
use crate::bridge::ProxyBridge;
use crate::config::Args;
use crate::disk::DiskMonitor;
use crate::ftp::{FtpConfig, FtpContext, FtpServer};
use crate::http::ProxyMode;
use crate::pathguard::PathGuard;
use crate::ratelimit::RateLimiter;
use crate::settings::Settings;
use crate::stats::Stats;
use crate::streamer::Streamer;

/// 初始化 tracing 日志订阅与默认过滤规则。
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn fatal(reason: &str) -> ! {
    eprintln!("fileshare: {reason}");
    std::process::exit(1);
}

fn default_rate_rules() -> Value {
    json!({
        "upload":   { "enabled": true, "maxRequests": 30,  "windowMs": 60000 },
        "download": { "enabled": true, "maxRequests": 300, "windowMs": 60000 },
        "disk":     { "enabled": true, "maxRequests": 60,  "windowMs": 60000 },
        "list":     { "enabled": true, "maxRequests": 240, "windowMs": 60000 },
        "status":   { "enabled": true, "maxRequests": 240, "windowMs": 60000 },
        "auth":     { "enabled": true, "maxRequests": 20,  "windowMs": 60000 },
        "fileops":  { "enabled": true, "maxRequests": 120, "windowMs": 60000 },
    })
}

/// Starts the fileshare server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    init_logging();

    let args = Args::parse();
    let share_root = PathBuf::from(&args.path);
    if !share_root.is_dir() {
        fatal(&format!("share path does not exist: {}", args.path));
    }
    let guard = match PathGuard::new(&share_root) {
        Ok(guard) => Arc::new(guard),
        Err(err) => fatal(&format!("cannot resolve share path: {err}")),
    };
    let share_root = guard.root().to_path_buf();
    let state_dir = share_root.join(config::STATE_DIR);
    tokio::fs::create_dir_all(&state_dir).await?;

    let settings = match Settings::load(&state_dir).await {
        Ok(settings) => Arc::new(settings),
        Err(err) => fatal(&format!("settings store unusable: {err}")),
    };
    for (name, default) in [
        (
            "uploads",
            json!({
                "maxFileSizeBytes": config::DEFAULT_MAX_FILE_SIZE,
                "directoryQuotaBytes": 0u64,
            }),
        ),
        (
            "ftp",
            json!({
                "enabled": true,
                "port": config::DEFAULT_FTP_PORT,
                "pasvPortMin": config::DEFAULT_PASV_PORT_MIN,
                "pasvPortMax": config::DEFAULT_PASV_PORT_MAX,
                "anonymousRead": false,
            }),
        ),
        ("haproxy", json!({ "proxyProtocolV2": false })),
        (
            "streamer",
            json!({ "segmentSeconds": config::HLS_SEGMENT_SECONDS, "preset": "veryfast" }),
        ),
        ("rateLimiter", default_rate_rules()),
    ] {
        if let Err(err) = settings.register_module(name, default).await {
            fatal(&format!("settings store unusable: {err}"));
        }
    }

    let auth = Arc::new(Auth::load(&state_dir).await);
    auth.spawn_flusher();
    let blocklist = Arc::new(BlockList::load(&state_dir).await);
    let stats = Arc::new(Stats::new());
    let limiter = Arc::new(RateLimiter::from_settings(
        &settings.module("rateLimiter").await,
    ));
    let disk = Arc::new(DiskMonitor::new(share_root.clone(), Arc::clone(&settings)));
    let streamer = Arc::new(Streamer::new(
        share_root.clone(),
        &state_dir,
        &settings.module("streamer").await,
    ));
    streamer.spawn_janitor();
    spawn_prune_task(Arc::clone(&stats), Arc::clone(&limiter));

    // The transcode cache must not outlive the process, panics included.
    let hls_cache_root = state_dir.join(config::HLS_CACHE_DIR);
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = std::fs::remove_dir_all(&hls_cache_root);
        default_panic(panic_info);
    }));

    let proxy_v2 = settings
        .module("haproxy")
        .await
        .get("proxyProtocolV2")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let ftp_config = FtpConfig::from_settings(&settings.module("ftp").await);
    if ftp_config.enabled {
        let ctx = Arc::new(FtpContext {
            guard: Arc::clone(&guard),
            auth: Arc::clone(&auth),
            blocklist: Arc::clone(&blocklist),
            stats: Arc::clone(&stats),
            anonymous_read: ftp_config.anonymous_read,
            pasv_port_min: ftp_config.pasv_port_min,
            pasv_port_max: ftp_config.pasv_port_max,
        });
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), ftp_config.port);
        match FtpServer::bind(addr, ctx).await {
            Ok(server) => {
                tokio::spawn(async move {
                    if let Err(err) = server.run().await {
                        error!(error = %err, "ftp server stopped");
                    }
                });
            }
            Err(err) => fatal(&format!("ftp port {} unavailable: {err}", ftp_config.port)),
        }
    }

    let app = Router::new()
        .route("/api/health", get(stats::get_health))
        .route("/api/status", get(stats::get_status))
        .route("/api/list", get(fileio::list_files))
        .route("/api/file", get(fileio::serve_file))
        .route("/api/disk", get(disk::get_disk))
        .route("/api/stream/playlist", get(streamer::stream_playlist))
        .route("/api/stream/file", get(streamer::stream_file))
        .route("/api/speedtest/download", get(speedtest::speedtest_download))
        .route(
            "/api/speedtest/upload",
            post(speedtest::speedtest_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/auth/register", post(auth::auth_register))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .route(
            "/api/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/mkdir", post(fileio::create_directory))
        .route("/api/rename", post(fileio::rename_entry))
        .route("/api/delete", post(fileio::delete_entry))
        .fallback(frontend::serve_frontend)
        .layer(middleware::from_fn(http::track_requests))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
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
        .layer(http::cors_layer())
        .layer(Extension(Arc::clone(&guard)))
        .layer(Extension(Arc::clone(&auth)))
        .layer(Extension(Arc::clone(&blocklist)))
        .layer(Extension(Arc::clone(&settings)))
        .layer(Extension(Arc::clone(&stats)))
        .layer(Extension(Arc::clone(&limiter)))
        .layer(Extension(Arc::clone(&disk)))
        .layer(Extension(Arc::clone(&streamer)))
        .layer(Extension(ProxyMode(proxy_v2)));

    let http_addr = if proxy_v2 {
        let Some(internal_port) = args.port.checked_add(1) else {
            fatal("no internal port available above the public port");
        };
        let public = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
        let internal = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), internal_port);
        match ProxyBridge::bind(public, internal).await {
            Ok(bridge) => {
                tokio::spawn(async move {
                    if let Err(err) = bridge.run().await {
                        error!(error = %err, "proxy bridge stopped");
                    }
                });
            }
            Err(err) => fatal(&format!("port {} unavailable: {err}", args.port)),
        }
        internal
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port)
    };

    let listener = match TcpListener::bind(http_addr).await {
        Ok(listener) => listener,
        Err(err) => fatal(&format!("port {} unavailable: {err}", http_addr.port())),
    };
    info!(share = %share_root.display(), addr = %http_addr, proxy_v2, "fileshare serving");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("flushing state before exit");
    auth.flush().await;
    streamer.purge_cache_sync();
    Ok(())
}

fn spawn_prune_task(stats: Arc<Stats>, limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            stats.prune().await;
            limiter.prune().await;
        }
    });
}

async fn shutdown_signal() {
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

    info!("Received termination signal shutting down");
}
