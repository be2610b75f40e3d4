//! Disk and quota probing for upload admission.
//!
//! Quota mode walks the share (cached 30 s) when `directoryQuotaBytes` is
//! set; otherwise the hosting filesystem's free space is used. Probe
//! failures fall back to the last cached value.

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::Disks;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::DISK_CACHE_TTL_SECS;
use crate::error::ApiError;
use crate::http::{ProxyMode, client_ip};
use crate::ratelimit::RateLimiter;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskScope {
    Disk,
    Quota,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f64,
    pub max_upload: u64,
    pub max_file_size: u64,
    pub scope: DiskScope,
    pub quota_bytes: u64,
}

#[derive(Debug)]
pub struct DiskMonitor {
    share_root: PathBuf,
    settings: Arc<Settings>,
    cache: Mutex<Option<(Instant, DiskInfo)>>,
}

impl DiskMonitor {
    pub fn new(share_root: PathBuf, settings: Arc<Settings>) -> Self {
        Self {
            share_root,
            settings,
            cache: Mutex::new(None),
        }
    }

    /// Current disk/quota info, served from cache within the TTL.
    pub async fn info(&self) -> Result<DiskInfo, ApiError> {
        let mut cache = self.cache.lock().await;
        if let Some((at, info)) = *cache
            && at.elapsed() < Duration::from_secs(DISK_CACHE_TTL_SECS)
        {
            return Ok(info);
        }

        match self.probe().await {
            Ok(info) => {
                *cache = Some((Instant::now(), info));
                Ok(info)
            }
            Err(err) => {
                // Keep serving the stale value if we have one.
                if let Some((_, info)) = *cache {
                    warn!("disk probe failed, serving cached value");
                    return Ok(info);
                }
                Err(err)
            }
        }
    }

    /// Drop the cache after writes so the next probe is fresh.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn probe(&self) -> Result<DiskInfo, ApiError> {
        let uploads = self.settings.module("uploads").await;
        let max_file_size = uploads
            .get("maxFileSizeBytes")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(crate::config::DEFAULT_MAX_FILE_SIZE);
        let quota_bytes = uploads
            .get("directoryQuotaBytes")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        let physical = physical_space(&self.share_root);

        if quota_bytes > 0 {
            // Quota accounting works even when no mount is visible; the
            // physical bound just drops out.
            let physical_free = physical.map(|(_, free)| free).unwrap_or(u64::MAX);
            let used = directory_size(self.share_root.clone()).await;
            let free = quota_bytes.saturating_sub(used);
            let max_upload = free.min(physical_free).min(max_file_size);
            Ok(DiskInfo {
                total: quota_bytes,
                free,
                used,
                used_percent: percent(used, quota_bytes),
                max_upload,
                max_file_size,
                scope: DiskScope::Quota,
                quota_bytes,
            })
        } else {
            let (physical_total, physical_free) =
                physical.ok_or_else(|| ApiError::Internal("disk probe failed".into()))?;
            let used = physical_total.saturating_sub(physical_free);
            Ok(DiskInfo {
                total: physical_total,
                free: physical_free,
                used,
                used_percent: percent(used, physical_total),
                max_upload: physical_free.min(max_file_size),
                max_file_size,
                scope: DiskScope::Disk,
                quota_bytes: 0,
            })
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64) * 100.0
}

/// Total/available space of the filesystem hosting `path`, by longest
/// mount-point match.
fn physical_space(path: &Path) -> Option<(u64, u64)> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(d, _, _)| depth >= d).unwrap_or(true) {
                best = Some((depth, disk.total_space(), disk.available_space()));
            }
        }
    }
    best.map(|(_, total, free)| (total, free))
}

/// Recursive size of a directory; inaccessible entries contribute 0.
pub async fn directory_size(root: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || walk_size(&root))
        .await
        .unwrap_or(0)
}

fn walk_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            total += walk_size(&entry.path());
        } else {
            total += metadata.len();
        }
    }
    total
}

/// 磁盘信息接口。
pub async fn get_disk(
    Extension(monitor): Extension<Arc<DiskMonitor>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<JsonResponse<DiskInfo>, ApiError> {
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("disk", &ip).await?;
    Ok(JsonResponse(monitor.info().await?))
}

#[cfg(test)]
mod tests {
    use super::{DiskMonitor, DiskScope, directory_size};
    use crate::settings::Settings;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn directory_size_sums_recursively() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("a/b")).expect("mkdir");
        std::fs::write(temp.path().join("a/x.bin"), vec![0u8; 10]).expect("write");
        std::fs::write(temp.path().join("a/b/y.bin"), vec![0u8; 5]).expect("write");
        assert_eq!(directory_size(temp.path().to_path_buf()).await, 15);
    }

    #[tokio::test]
    async fn missing_directory_contributes_zero() {
        let temp = tempdir().expect("tempdir");
        let gone = temp.path().join("nope");
        assert_eq!(directory_size(gone).await, 0);
    }

    #[tokio::test]
    async fn quota_scope_reports_quota_totals() {
        let temp = tempdir().expect("tempdir");
        let settings = Arc::new(Settings::load(temp.path()).await.expect("settings"));
        settings
            .register_module(
                "uploads",
                json!({ "maxFileSizeBytes": 1000u64, "directoryQuotaBytes": 100u64 }),
            )
            .await
            .expect("register");
        std::fs::write(temp.path().join("data.bin"), vec![0u8; 40]).expect("write");

        let monitor = DiskMonitor::new(temp.path().to_path_buf(), settings);
        let info = monitor.info().await.expect("info");
        assert_eq!(info.scope, DiskScope::Quota);
        assert_eq!(info.total, 100);
        assert!(info.used >= 40, "walk should count the seeded file");
        assert!(info.max_upload <= 60);
    }

    #[tokio::test]
    async fn disk_scope_uses_filesystem_space() {
        let temp = tempdir().expect("tempdir");
        let settings = Arc::new(Settings::load(temp.path()).await.expect("settings"));
        settings
            .register_module(
                "uploads",
                json!({ "maxFileSizeBytes": 1u64 << 40, "directoryQuotaBytes": 0u64 }),
            )
            .await
            .expect("register");

        let monitor = DiskMonitor::new(temp.path().to_path_buf(), settings);
        // Containers without visible mounts make the probe fail; only the
        // successful shape is asserted.
        if let Ok(info) = monitor.info().await {
            assert_eq!(info.scope, DiskScope::Disk);
            assert!(info.total > 0);
        }
    }
}
