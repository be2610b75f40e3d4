//! On-demand HLS playlist synthesis and segment transcoding.
//!
//! Sources are fingerprinted by `(absolute path, size, mtime)`; each
//! fingerprint owns a cache directory under `.fileshare/cache/hls`.
//! Segment jobs are deduplicated per `(cache dir, index)` and the
//! transcoder pool is capped by a counting semaphore. Sources above the
//! no-cache threshold serve transient segments that self-delete after a
//! grace window.

mod cache;
mod playlist;
mod transcode;

pub use playlist::stream_playlist;
pub use transcode::stream_file;

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use crate::config::{HLS_JANITOR_INTERVAL_SECS, HLS_SEGMENT_SECONDS, MAX_TRANSCODERS};

const PRESETS: [&str; 4] = ["ultrafast", "superfast", "veryfast", "faster"];

#[derive(Debug)]
pub struct Streamer {
    share_root: PathBuf,
    hls_root: PathBuf,
    root_hash: String,
    seg_seconds: f64,
    preset: String,
    inflight: Mutex<HashMap<(PathBuf, u32), Arc<Mutex<()>>>>,
    slots: Arc<Semaphore>,
    /// Duration memo for no-cache sources, keyed by fingerprint.
    durations: Mutex<HashMap<String, f64>>,
}

impl Streamer {
    pub fn new(share_root: PathBuf, state_dir: &std::path::Path, module: &Value) -> Self {
        let seg_seconds = module
            .get("segmentSeconds")
            .and_then(Value::as_f64)
            .filter(|secs| *secs > 0.0)
            .unwrap_or(HLS_SEGMENT_SECONDS);
        let preset = module
            .get("preset")
            .and_then(Value::as_str)
            .filter(|preset| PRESETS.contains(preset))
            .unwrap_or("veryfast")
            .to_string();
        let hls_root = state_dir.join(crate::config::HLS_CACHE_DIR);
        let root_hash = cache::sha1_hex(share_root.to_string_lossy().as_bytes());
        Self {
            share_root,
            hls_root,
            root_hash,
            seg_seconds,
            preset,
            inflight: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(MAX_TRANSCODERS)),
            durations: Mutex::new(HashMap::new()),
        }
    }

    pub fn segment_seconds(&self) -> f64 {
        self.seg_seconds
    }

    /// Periodic sweep of expired cache entries.
    pub fn spawn_janitor(self: &Arc<Self>) {
        let streamer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(HLS_JANITOR_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(err) = cache::sweep(&streamer.hls_root).await {
                    warn!(error = %err, "hls janitor sweep failed");
                }
            }
        });
    }

    /// Synchronous cache removal for shutdown paths.
    pub fn purge_cache_sync(&self) {
        let _ = std::fs::remove_dir_all(&self.hls_root);
    }
}
