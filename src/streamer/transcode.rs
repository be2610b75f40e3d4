//! 分段生成：去重的 ffmpeg 拷贝/转码作业与限额信号量。

use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::Streamer;
use super::cache::{self, HlsSource};
use super::playlist::{segment_count, source_duration};
use crate::blocklist::BlockList;
use crate::error::ApiError;
use crate::pathguard::PathGuard;

#[derive(Deserialize)]
pub(crate) struct SegmentQuery {
    path: String,
    file: String,
}

/// 流媒体分段接口。
pub async fn stream_file(
    Query(query): Query<SegmentQuery>,
    Extension(streamer): Extension<Arc<Streamer>>,
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(blocklist): Extension<Arc<BlockList>>,
) -> Result<Response, ApiError> {
    let index = parse_segment_name(&query.file)
        .ok_or_else(|| ApiError::BadRequest("invalid segment name".into()))?;
    let source = streamer
        .resolve_source(&guard, &blocklist, &query.path)
        .await?;
    fs::create_dir_all(&source.cache_dir).await?;
    cache::touch_access(&source.cache_dir).await;

    let segment = source.cache_dir.join(&query.file);
    if fs::metadata(&segment).await.is_ok() {
        return serve_segment(&streamer, &source, &segment, index).await;
    }

    let duration = source_duration(&streamer, &source).await?;
    if let Some(duration) = duration {
        let total = segment_count(duration, streamer.segment_seconds());
        if index >= total {
            return Err(ApiError::NotFound("segment out of range".into()));
        }
    }

    // One job per (cache dir, index); latecomers block on the same latch
    // and find the finished file afterwards.
    let latch = {
        let mut inflight = streamer.inflight.lock().await;
        Arc::clone(
            inflight
                .entry((source.cache_dir.clone(), index))
                .or_default(),
        )
    };
    let job_result = {
        let _held = latch.lock().await;
        if fs::metadata(&segment).await.is_ok() {
            Ok(())
        } else {
            let _permit = streamer
                .slots
                .acquire()
                .await
                .map_err(|_| ApiError::Internal("transcoder pool closed".into()))?;
            generate_segment(&streamer, &source, &segment, index).await
        }
    };
    {
        // Drop the latch key whether the job succeeded or not.
        let mut inflight = streamer.inflight.lock().await;
        inflight.remove(&(source.cache_dir.clone(), index));
    }
    job_result?;

    serve_segment(&streamer, &source, &segment, index).await
}

async fn serve_segment(
    streamer: &Streamer,
    source: &HlsSource,
    segment: &Path,
    index: u32,
) -> Result<Response, ApiError> {
    let bytes = fs::read(segment).await?;
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
    if source.no_cache {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        let last = match cache::read_meta(&source.cache_dir).await {
            Some(meta) => index + 1 == meta.total_segments,
            None => match streamer.recall_duration(&source.fingerprint).await {
                Some(duration) => {
                    index + 1 == segment_count(duration, streamer.segment_seconds())
                }
                None => false,
            },
        };
        cache::schedule_grace_delete(
            segment.to_path_buf(),
            source.cache_dir.clone(),
            last,
        );
    } else {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=3600"),
        );
    }
    debug!(path = %source.rel, index, bytes = bytes.len(), "segment served");
    Ok((StatusCode::OK, headers, bytes).into_response())
}

/// Cut one segment: seek-and-stream-copy first, full transcode on failure.
/// The output lands under a `.part` name and is renamed once complete so a
/// visible segment file is always whole.
async fn generate_segment(
    streamer: &Streamer,
    source: &HlsSource,
    segment: &Path,
    index: u32,
) -> Result<(), ApiError> {
    let seg = streamer.segment_seconds();
    let start = f64::from(index) * seg;
    let length = seg + 0.5;
    let part = segment.with_extension("ts.part");

    let copied = run_ffmpeg(copy_args(&source.abs, start, length, &part)).await?;
    if copied && part_is_usable(&part).await {
        fs::rename(&part, segment).await?;
        info!(path = %source.rel, index, "segment stream-copied");
        return Ok(());
    }
    let _ = fs::remove_file(&part).await;
    warn!(path = %source.rel, index, "stream copy failed, transcoding");

    let transcoded =
        run_ffmpeg(transcode_args(&source.abs, start, length, &streamer.preset, &part)).await?;
    if transcoded && part_is_usable(&part).await {
        fs::rename(&part, segment).await?;
        info!(path = %source.rel, index, "segment transcoded");
        return Ok(());
    }
    let _ = fs::remove_file(&part).await;
    Err(ApiError::Internal("segment generation failed".into()))
}

async fn part_is_usable(part: &Path) -> bool {
    fs::metadata(part)
        .await
        .map(|metadata| metadata.len() > 0)
        .unwrap_or(false)
}

async fn run_ffmpeg(args: Vec<String>) -> Result<bool, ApiError> {
    match Command::new("ffmpeg").args(&args).output().await {
        Ok(output) => Ok(output.status.success()),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(ApiError::TranscoderMissing),
        Err(_) => Err(ApiError::Internal("transcoder spawn failed".into())),
    }
}

fn copy_args(src: &Path, start: f64, length: f64, out: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{start:.3}"),
        "-i".into(),
        src.to_string_lossy().into_owned(),
        "-t".into(),
        format!("{length:.3}"),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-f".into(),
        "mpegts".into(),
        "-y".into(),
        out.to_string_lossy().into_owned(),
    ]
}

fn transcode_args(src: &Path, start: f64, length: f64, preset: &str, out: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{start:.3}"),
        "-i".into(),
        src.to_string_lossy().into_owned(),
        "-t".into(),
        format!("{length:.3}"),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        preset.into(),
        "-crf".into(),
        "26".into(),
        "-profile:v".into(),
        "main".into(),
        "-level".into(),
        "4.0".into(),
        "-g".into(),
        "60".into(),
        "-keyint_min".into(),
        "60".into(),
        "-sc_threshold".into(),
        "0".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "96k".into(),
        "-ac".into(),
        "2".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        "mpegts".into(),
        "-y".into(),
        out.to_string_lossy().into_owned(),
    ]
}

/// Strictly `seg_NNNNN.ts`, returning the segment index.
pub(super) fn parse_segment_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("seg_")?.strip_suffix(".ts")?;
    if digits.len() != 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamer::Streamer;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Mutex as TokioMutex;

    #[test]
    fn segment_names_validate_strictly() {
        assert_eq!(parse_segment_name("seg_00003.ts"), Some(3));
        assert_eq!(parse_segment_name("seg_12345.ts"), Some(12345));
        assert_eq!(parse_segment_name("seg_123.ts"), None);
        assert_eq!(parse_segment_name("seg_abcde.ts"), None);
        assert_eq!(parse_segment_name("seg_000001.ts"), None);
        assert_eq!(parse_segment_name("../../../etc/passwd"), None);
        assert_eq!(parse_segment_name("seg_00001.mp4"), None);
    }

    #[test]
    fn ffmpeg_argument_contracts() {
        let copy = copy_args(Path::new("/v.mp4"), 30.0, 10.5, Path::new("/out.ts.part"));
        assert!(copy.windows(2).any(|w| w == ["-ss", "30.000"]));
        assert!(copy.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(copy.windows(2).any(|w| w == ["-f", "mpegts"]));

        let enc = transcode_args(
            Path::new("/v.mp4"),
            30.0,
            10.5,
            "veryfast",
            Path::new("/out.ts.part"),
        );
        assert!(enc.windows(2).any(|w| w == ["-preset", "veryfast"]));
        assert!(enc.windows(2).any(|w| w == ["-crf", "26"]));
        assert!(enc.windows(2).any(|w| w == ["-b:a", "96k"]));
        assert!(enc.windows(2).any(|w| w == ["-g", "60"]));
    }

    /// The inflight latch admits one job per key; late arrivals see the
    /// finished file instead of spawning their own job.
    #[tokio::test]
    async fn inflight_latch_runs_job_once() {
        let temp = tempdir().expect("tempdir");
        let streamer = Arc::new(Streamer::new(
            temp.path().to_path_buf(),
            temp.path(),
            &json!({}),
        ));
        let segment = temp.path().join("seg_00000.ts");
        let jobs = Arc::new(AtomicU32::new(0));
        let key = (temp.path().to_path_buf(), 0u32);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let streamer = Arc::clone(&streamer);
            let segment = segment.clone();
            let jobs = Arc::clone(&jobs);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let latch: Arc<TokioMutex<()>> = {
                    let mut inflight = streamer.inflight.lock().await;
                    Arc::clone(inflight.entry(key.clone()).or_default())
                };
                let _held = latch.lock().await;
                if tokio::fs::metadata(&segment).await.is_err() {
                    jobs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    tokio::fs::write(&segment, b"segment-bytes").await.expect("write");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(jobs.load(Ordering::SeqCst), 1, "exactly one job ran");
        assert_eq!(
            tokio::fs::read(&segment).await.expect("read"),
            b"segment-bytes"
        );
    }

    /// The semaphore admits at most two concurrent workers.
    #[tokio::test]
    async fn transcoder_slots_cap_concurrency() {
        let temp = tempdir().expect("tempdir");
        let streamer = Arc::new(Streamer::new(
            temp.path().to_path_buf(),
            temp.path(),
            &json!({}),
        ));
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let streamer = Arc::clone(&streamer);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = streamer.slots.acquire().await.expect("permit");
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "pool capped at 2");
    }
}
