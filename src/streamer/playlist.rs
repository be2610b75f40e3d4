//! 播放列表合成：探测时长并生成 VOD 或渐进式清单。

use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use super::Streamer;
use super::cache::{self, CacheMeta, HlsSource};
use crate::blocklist::BlockList;
use crate::error::ApiError;
use crate::pathguard::PathGuard;

const PLAYLIST_FILE: &str = "index.m3u8";
const PROGRESSIVE_LOOKAHEAD: u32 = 3;

#[derive(Deserialize)]
pub(crate) struct PlaylistQuery {
    path: String,
}

/// 流媒体清单接口。
pub async fn stream_playlist(
    Query(query): Query<PlaylistQuery>,
    Extension(streamer): Extension<Arc<Streamer>>,
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(blocklist): Extension<Arc<BlockList>>,
) -> Result<Response, ApiError> {
    let source = streamer
        .resolve_source(&guard, &blocklist, &query.path)
        .await?;
    fs::create_dir_all(&source.cache_dir).await?;
    cache::touch_access(&source.cache_dir).await;

    // A finalized playlist for a cached source is authoritative.
    if !source.no_cache {
        let persisted = source.cache_dir.join(PLAYLIST_FILE);
        if let Ok(existing) = fs::read_to_string(&persisted).await
            && existing.contains("#EXT-X-ENDLIST")
        {
            debug!(path = %source.rel, "serving persisted playlist");
            return playlist_response(rewrite_segment_uris(&existing, &source.rel));
        }
    }

    let seg = streamer.segment_seconds();
    let duration = source_duration(&streamer, &source).await?;

    let playlist = match duration {
        Some(duration) => {
            let playlist = vod_playlist(duration, seg);
            if !source.no_cache {
                let total_segments = segment_count(duration, seg);
                let _ = fs::write(source.cache_dir.join(PLAYLIST_FILE), &playlist).await;
                let _ = cache::write_meta(
                    &source.cache_dir,
                    &CacheMeta {
                        duration_sec: duration,
                        total_segments,
                        seg_sec: seg,
                    },
                )
                .await;
            }
            info!(path = %source.rel, size = source.size, duration, "playlist synthesized");
            playlist
        }
        None => {
            let existing = existing_segments(&source.cache_dir).await;
            info!(path = %source.rel, existing, "progressive playlist");
            progressive_playlist(existing, PROGRESSIVE_LOOKAHEAD, seg)
        }
    };

    playlist_response(rewrite_segment_uris(&playlist, &source.rel))
}

fn playlist_response(body: String) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.apple.mpegurl"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Probe the source duration, memoizing it for no-cache sources and
/// persisting it via `meta.json` for cached ones.
pub(super) async fn source_duration(
    streamer: &Streamer,
    source: &HlsSource,
) -> Result<Option<f64>, ApiError> {
    if let Some(meta) = cache::read_meta(&source.cache_dir).await {
        return Ok(Some(meta.duration_sec));
    }
    if let Some(duration) = streamer.recall_duration(&source.fingerprint).await {
        return Ok(Some(duration));
    }

    let probed = probe_duration(&source.abs).await?;
    if let Some(duration) = probed {
        streamer.remember_duration(&source.fingerprint, duration).await;
    }
    Ok(probed)
}

/// ffprobe first; fall back to scraping `Duration:` from ffmpeg stderr.
async fn probe_duration(src: &Path) -> Result<Option<f64>, ApiError> {
    match Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(src)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            if let Ok(duration) = text.trim().parse::<f64>()
                && duration.is_finite()
                && duration > 0.0
            {
                return Ok(Some(duration));
            }
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            // ffprobe missing does not imply ffmpeg missing; fall through.
        }
        Err(_) => return Err(ApiError::Internal("probe failed".into())),
    }

    match Command::new("ffmpeg").arg("-i").arg(src).output().await {
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(parse_ffmpeg_duration(&stderr))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Err(ApiError::TranscoderMissing),
        Err(_) => Err(ApiError::Internal("probe failed".into())),
    }
}

/// Parse `Duration: HH:MM:SS.f` out of ffmpeg's banner output.
pub(super) fn parse_ffmpeg_duration(stderr: &str) -> Option<f64> {
    let line = stderr.lines().find(|line| line.contains("Duration:"))?;
    let after = line.split("Duration:").nth(1)?.trim();
    let stamp = after.split([',', ' ']).next()?;
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.trim().parse().ok()?;
    let minutes: f64 = parts.next()?.trim().parse().ok()?;
    let seconds: f64 = parts.next()?.trim().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

pub(super) fn segment_count(duration: f64, seg: f64) -> u32 {
    (duration / seg).ceil().max(1.0) as u32
}

pub(super) fn segment_name(index: u32) -> String {
    format!("seg_{index:05}.ts")
}

/// Complete VOD playlist: fixed-length segments with a remainder tail.
pub(super) fn vod_playlist(duration: f64, seg: f64) -> String {
    let total = segment_count(duration, seg);
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", seg.ceil() as u32));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    for index in 0..total {
        let remaining = duration - f64::from(index) * seg;
        let length = remaining.min(seg);
        out.push_str(&format!("#EXTINF:{length:.3},\n"));
        out.push_str(&segment_name(index));
        out.push('\n');
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Open-ended playlist used when the duration is unknown: every existing
/// segment plus a short look-ahead, no ENDLIST.
pub(super) fn progressive_playlist(existing: u32, lookahead: u32, seg: f64) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", seg.ceil() as u32));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    for index in 0..existing + lookahead {
        out.push_str(&format!("#EXTINF:{seg:.3},\n"));
        out.push_str(&segment_name(index));
        out.push('\n');
    }
    out
}

/// Count contiguous `seg_NNNNN.ts` files already on disk.
async fn existing_segments(cache_dir: &Path) -> u32 {
    let mut count = 0;
    loop {
        let path = cache_dir.join(segment_name(count));
        if fs::metadata(&path).await.is_err() {
            break;
        }
        count += 1;
    }
    count
}

/// Map bare segment names onto the streaming API.
pub(super) fn rewrite_segment_uris(playlist: &str, source_rel: &str) -> String {
    let encoded = utf8_percent_encode(source_rel, NON_ALPHANUMERIC).to_string();
    let mut out = String::with_capacity(playlist.len() * 2);
    for line in playlist.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            out.push_str(&format!("/api/stream/file?path={encoded}&file={trimmed}"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vod_playlist_shape() {
        let playlist = vod_playlist(25.0, 10.0);
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:10"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(playlist.contains("seg_00000.ts"));
        assert!(playlist.contains("seg_00002.ts"));
        assert!(!playlist.contains("seg_00003.ts"));
        assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
        // Remainder tail: 25 = 10 + 10 + 5.
        assert!(playlist.contains("#EXTINF:5.000,"));
    }

    #[test]
    fn vod_playlist_exact_multiple_has_no_short_tail() {
        let playlist = vod_playlist(20.0, 10.0);
        let tails: Vec<_> = playlist
            .lines()
            .filter(|line| line.starts_with("#EXTINF:"))
            .collect();
        assert_eq!(tails, vec!["#EXTINF:10.000,", "#EXTINF:10.000,"]);
    }

    #[test]
    fn progressive_playlist_has_lookahead_and_no_endlist() {
        let playlist = progressive_playlist(2, 3, 10.0);
        assert!(playlist.contains("seg_00004.ts"));
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn ffmpeg_banner_duration_parses() {
        let stderr = "Input #0, mov,mp4\n  Duration: 01:02:03.50, start: 0.000000, bitrate: 1000 kb/s\n";
        let duration = parse_ffmpeg_duration(stderr).expect("duration");
        assert!((duration - 3723.5).abs() < 0.001);
        assert!(parse_ffmpeg_duration("no duration here").is_none());
    }

    #[test]
    fn segment_counting_rounds_up() {
        assert_eq!(segment_count(25.0, 10.0), 3);
        assert_eq!(segment_count(20.0, 10.0), 2);
        assert_eq!(segment_count(0.5, 10.0), 1);
    }

    #[test]
    fn segment_uris_rewritten_through_api() {
        let playlist = "#EXTM3U\n#EXTINF:10.000,\nseg_00000.ts\n";
        let out = rewrite_segment_uris(playlist, "videos/v.mp4");
        assert!(out.contains(
            "/api/stream/file?path=videos%2Fv%2Emp4&file=seg_00000.ts"
        ));
        assert!(out.contains("#EXTINF:10.000,"));
    }

    #[test]
    fn segment_names_are_zero_padded() {
        assert_eq!(segment_name(3), "seg_00003.ts");
        assert_eq!(segment_name(12345), "seg_12345.ts");
    }
}
