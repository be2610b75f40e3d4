//! Transfer counters, sliding-window bandwidth, and per-file tallies.

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::{ACTIVE_CLIENT_TTL_SECS, BANDWIDTH_WINDOW_SECS};
use crate::error::ApiError;
use crate::http::{ProxyMode, client_ip};
use crate::ratelimit::RateLimiter;

#[derive(Debug)]
struct BandwidthSample {
    at: Instant,
    dl_bytes: u64,
    ul_bytes: u64,
}

/// Process-wide transfer statistics. Counters are monotonic; reads take a
/// snapshot counter by counter.
#[derive(Debug, Default)]
pub struct Stats {
    started_at: Option<Instant>,
    total_downloads: AtomicU64,
    total_download_bytes: AtomicU64,
    total_uploads: AtomicU64,
    total_upload_bytes: AtomicU64,
    active_requests: AtomicU64,
    samples: Mutex<VecDeque<BandwidthSample>>,
    file_downloads: Mutex<HashMap<String, u64>>,
    active_clients: Mutex<HashMap<String, Instant>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_downloads: u64,
    pub total_download_bytes: u64,
    pub total_uploads: u64,
    pub total_upload_bytes: u64,
    pub active_requests: u64,
    pub active_clients: u64,
    pub download_bytes_per_sec: u64,
    pub upload_bytes_per_sec: u64,
    pub uptime_sec: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Some(Instant::now()),
            ..Self::default()
        }
    }

    pub async fn record_download(&self, relative: &str, bytes: u64) {
        self.total_downloads.fetch_add(1, Ordering::Relaxed);
        self.total_download_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.push_sample(bytes, 0).await;
        let mut files = self.file_downloads.lock().await;
        *files.entry(relative.to_string()).or_insert(0) += 1;
    }

    pub async fn record_upload(&self, bytes: u64) {
        self.total_uploads.fetch_add(1, Ordering::Relaxed);
        self.total_upload_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.push_sample(0, bytes).await;
    }

    pub async fn download_count(&self, relative: &str) -> u64 {
        let files = self.file_downloads.lock().await;
        files.get(relative).copied().unwrap_or(0)
    }

    /// RAII guard for the active-request gauge; decrements on drop so error
    /// paths are covered.
    pub fn request_guard(self: &Arc<Self>) -> RequestGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            stats: Arc::clone(self),
        }
    }

    pub async fn touch_client(&self, ip: &str) {
        let mut clients = self.active_clients.lock().await;
        clients.insert(ip.to_string(), Instant::now());
    }

    /// Drop expired client entries and stale bandwidth samples.
    pub async fn prune(&self) {
        let now = Instant::now();
        let ttl = Duration::from_secs(ACTIVE_CLIENT_TTL_SECS);
        self.active_clients
            .lock()
            .await
            .retain(|_, seen| now.duration_since(*seen) < ttl);
        let cutoff = Duration::from_secs(BANDWIDTH_WINDOW_SECS);
        let mut samples = self.samples.lock().await;
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) >= cutoff {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let (dl_rate, ul_rate) = self.bandwidth().await;
        let now = Instant::now();
        let ttl = Duration::from_secs(ACTIVE_CLIENT_TTL_SECS);
        let active_clients = {
            let clients = self.active_clients.lock().await;
            clients
                .values()
                .filter(|seen| now.duration_since(**seen) < ttl)
                .count() as u64
        };
        StatsSnapshot {
            total_downloads: self.total_downloads.load(Ordering::Relaxed),
            total_download_bytes: self.total_download_bytes.load(Ordering::Relaxed),
            total_uploads: self.total_uploads.load(Ordering::Relaxed),
            total_upload_bytes: self.total_upload_bytes.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            active_clients,
            download_bytes_per_sec: dl_rate,
            upload_bytes_per_sec: ul_rate,
            uptime_sec: self
                .started_at
                .map(|at| at.elapsed().as_secs())
                .unwrap_or(0),
        }
    }

    async fn push_sample(&self, dl_bytes: u64, ul_bytes: u64) {
        let mut samples = self.samples.lock().await;
        samples.push_back(BandwidthSample {
            at: Instant::now(),
            dl_bytes,
            ul_bytes,
        });
    }

    /// Average bytes/sec over the retained window, evicting stale samples.
    async fn bandwidth(&self) -> (u64, u64) {
        let now = Instant::now();
        let cutoff = Duration::from_secs(BANDWIDTH_WINDOW_SECS);
        let mut samples = self.samples.lock().await;
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) >= cutoff {
                samples.pop_front();
            } else {
                break;
            }
        }
        let Some(oldest) = samples.front() else {
            return (0, 0);
        };
        let span = now.duration_since(oldest.at).as_secs().max(1);
        let (dl, ul) = samples.iter().fold((0u64, 0u64), |(dl, ul), sample| {
            (dl + sample.dl_bytes, ul + sample.ul_bytes)
        });
        (dl / span, ul / span)
    }
}

pub struct RequestGuard {
    stats: Arc<Stats>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.stats.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 状态接口：返回计数器与带宽快照。
pub async fn get_status(
    Extension(stats): Extension<Arc<Stats>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<JsonResponse<StatsSnapshot>, ApiError> {
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("status", &ip).await?;
    Ok(JsonResponse(stats.snapshot().await))
}

/// 健康检查接口。
pub async fn get_health(
    Extension(stats): Extension<Arc<Stats>>,
) -> JsonResponse<serde_json::Value> {
    let snapshot = stats.snapshot().await;
    JsonResponse(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSec": snapshot.uptime_sec,
    }))
}
