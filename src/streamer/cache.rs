//! Cache directory layout, fingerprints, liveness, and eviction.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, warn};

use crate::blocklist::BlockList;
use crate::config::{HLS_ENTRY_TTL_SECS, HLS_NO_CACHE_GRACE_SECS, HLS_NO_CACHE_THRESHOLD};
use crate::error::ApiError;
use crate::pathguard::PathGuard;

use super::Streamer;

const ATIME_SIDECAR: &str = ".atime";
const ELIGIBLE_EXTENSIONS: [&str; 3] = ["mp4", "m4v", "mov"];

/// A stream source resolved to its cache identity.
#[derive(Debug, Clone)]
pub struct HlsSource {
    pub abs: PathBuf,
    pub rel: String,
    pub size: u64,
    pub fingerprint: String,
    pub cache_dir: PathBuf,
    pub no_cache: bool,
}

/// Persisted alongside cached segments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub duration_sec: f64,
    pub total_segments: u32,
    pub seg_sec: f64,
}

impl Streamer {
    /// Resolve a share-relative path into an eligible HLS source.
    pub(super) async fn resolve_source(
        &self,
        guard: &PathGuard,
        blocklist: &BlockList,
        relative: &str,
    ) -> Result<HlsSource, ApiError> {
        let ext = relative
            .rsplit('.')
            .next()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !ELIGIBLE_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ApiError::BadRequest("not a streamable source".into()));
        }

        let abs = guard.resolve_read(relative).await?;
        let rel = guard.relative_of(&abs).ok_or(ApiError::PathDenied)?;
        if blocklist.is_blocked(&abs, &rel).await {
            return Err(ApiError::Blocked);
        }
        let metadata = fs::metadata(&abs).await?;
        if !metadata.is_file() {
            return Err(ApiError::NotFound("not a file".into()));
        }

        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let fingerprint = sha1_hex(
            format!("{}:{}:{}", abs.to_string_lossy(), metadata.len(), mtime_ns).as_bytes(),
        );
        let cache_dir = self.hls_root.join(&self.root_hash).join(&fingerprint);

        Ok(HlsSource {
            abs,
            rel,
            size: metadata.len(),
            fingerprint,
            cache_dir,
            no_cache: metadata.len() > HLS_NO_CACHE_THRESHOLD,
        })
    }

    pub(super) async fn remember_duration(&self, fingerprint: &str, duration: f64) {
        let mut durations = self.durations.lock().await;
        durations.insert(fingerprint.to_string(), duration);
    }

    pub(super) async fn recall_duration(&self, fingerprint: &str) -> Option<f64> {
        let durations = self.durations.lock().await;
        durations.get(fingerprint).copied()
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    crate::auth::hex_encode(&digest)
}

/// Refresh the entry's liveness signal. Directory mtime when the host
/// filesystem allows it, a sidecar timestamp otherwise.
pub async fn touch_access(dir: &Path) {
    let touched = std::fs::File::open(dir)
        .and_then(|handle| handle.set_modified(SystemTime::now()))
        .is_ok();
    if !touched {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let _ = fs::write(dir.join(ATIME_SIDECAR), millis.to_string()).await;
    }
}

/// Time since the entry was last accessed; sidecar wins over mtime.
pub async fn entry_age(dir: &Path) -> Option<Duration> {
    if let Ok(contents) = fs::read_to_string(dir.join(ATIME_SIDECAR)).await
        && let Ok(millis) = contents.trim().parse::<u64>()
    {
        let accessed = UNIX_EPOCH + Duration::from_millis(millis);
        return SystemTime::now().duration_since(accessed).ok();
    }
    let metadata = fs::metadata(dir).await.ok()?;
    let modified = metadata.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// One janitor pass: drop expired source directories, prune empty root
/// hashes.
pub async fn sweep(hls_root: &Path) -> std::io::Result<()> {
    let ttl = Duration::from_secs(HLS_ENTRY_TTL_SECS);
    let Ok(mut roots) = fs::read_dir(hls_root).await else {
        return Ok(());
    };
    while let Some(root) = roots.next_entry().await? {
        if !root.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
            continue;
        }
        let mut entries = fs::read_dir(root.path()).await?;
        let mut remaining = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            match entry_age(&entry.path()).await {
                Some(age) if age >= ttl => {
                    debug!(path = ?entry.path(), "evicting expired hls entry");
                    if let Err(err) = fs::remove_dir_all(entry.path()).await {
                        warn!(path = ?entry.path(), error = %err, "hls eviction failed");
                        remaining += 1;
                    }
                }
                _ => remaining += 1,
            }
        }
        if remaining == 0 {
            let _ = fs::remove_dir(root.path()).await;
        }
    }
    Ok(())
}

/// Transient-segment cleanup for no-cache sources: the file goes after the
/// grace window; the final segment also takes the directory with it.
pub fn schedule_grace_delete(segment: PathBuf, cache_dir: PathBuf, last_segment: bool) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(HLS_NO_CACHE_GRACE_SECS)).await;
        let _ = fs::remove_file(&segment).await;
        if last_segment {
            let _ = fs::remove_dir_all(&cache_dir).await;
        }
    });
}

/// Read persisted metadata for a cached source.
pub async fn read_meta(cache_dir: &Path) -> Option<CacheMeta> {
    let bytes = fs::read(cache_dir.join("meta.json")).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub async fn write_meta(cache_dir: &Path, meta: &CacheMeta) -> std::io::Result<()> {
    let bytes =
        serde_json::to_vec(meta).map_err(|err| std::io::Error::other(err.to_string()))?;
    fs::write(cache_dir.join("meta.json"), bytes).await
}
