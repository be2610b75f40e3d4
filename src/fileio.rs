//! 文件列表、下载与目录操作处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Query, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Json as JsonResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use httpdate::{fmt_http_date, parse_http_date};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::auth::{Auth, require_auth};
use crate::blocklist::BlockList;
use crate::disk::{DiskMonitor, directory_size};
use crate::error::ApiError;
use crate::http::{ProxyMode, client_ip};
use crate::mime::content_type_for;
use crate::pathguard::PathGuard;
use crate::ratelimit::RateLimiter;
use crate::stats::Stats;

/// User-agent substrings identifying social-preview bots.
const PREVIEW_BOTS: [&str; 9] = [
    "discordbot",
    "slackbot",
    "twitterbot",
    "facebookexternalhit",
    "linkedinbot",
    "whatsapp",
    "telegrambot",
    "line",
    "skypeuripreview",
];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_count: Option<u64>,
}

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FileQuery {
    path: String,
    download: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct MkdirBody {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    from: String,
    to: String,
}

#[derive(Deserialize)]
pub(crate) struct DeleteBody {
    path: String,
}

/// 列出目录内容（目录体积为递归统计）。
pub async fn list_files(
    Query(query): Query<ListQuery>,
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(blocklist): Extension<Arc<BlockList>>,
    Extension(stats): Extension<Arc<Stats>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("list", &ip).await?;

    let relative = query.path.unwrap_or_default();
    let target = if relative.is_empty() {
        guard.root().to_path_buf()
    } else {
        guard.resolve_read(&relative).await?
    };
    let metadata = fs::metadata(&target).await?;
    if !metadata.is_dir() {
        return Err(ApiError::NotFound("not a directory".into()));
    }

    let mut dir = fs::read_dir(&target).await?;
    let mut files = Vec::new();
    let mut dir_jobs = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == crate::config::STATE_DIR {
            continue;
        }
        let path = entry.path();
        let Some(rel) = guard.relative_of(&path) else {
            continue;
        };
        if blocklist.is_blocked(&path, &rel).await {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let mtime = metadata
            .modified()
            .ok()
            .map(|ts| DateTime::<Utc>::from(ts).to_rfc3339_opts(SecondsFormat::Secs, true));
        if metadata.is_dir() {
            dir_jobs.push((files.len(), directory_size(path.clone())));
            files.push(FileEntry {
                name,
                path: rel,
                is_dir: true,
                size: 0,
                mtime,
                download_count: None,
            });
        } else {
            let download_count = match stats.download_count(&rel).await {
                0 => None,
                count => Some(count),
            };
            files.push(FileEntry {
                name,
                path: rel,
                is_dir: false,
                size: metadata.len(),
                mtime,
                download_count,
            });
        }
    }

    // Directory sizes walk in parallel; failures already collapse to 0.
    let (indexes, jobs): (Vec<_>, Vec<_>) = dir_jobs.into_iter().unzip();
    for (index, size) in indexes.into_iter().zip(join_all(jobs).await) {
        files[index].size = size;
    }

    files.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    info!(path = %relative, count = files.len(), "list files");
    Ok(JsonResponse(files))
}

/// 下载文件：支持 Range、HEAD、强制下载与播放列表重写。
pub async fn serve_file(
    method: Method,
    Query(query): Query<FileQuery>,
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(blocklist): Extension<Arc<BlockList>>,
    Extension(stats): Extension<Arc<Stats>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ip = client_ip(&request_headers, Some(addr.ip()), proxy.0);
    limiter.check("download", &ip).await?;

    let target = guard.resolve_read(&query.path).await?;
    let rel = guard
        .relative_of(&target)
        .ok_or(ApiError::PathDenied)?;
    if blocklist.is_blocked(&target, &rel).await {
        return Err(ApiError::Blocked);
    }
    let metadata = fs::metadata(&target).await?;
    if metadata.is_dir() {
        return Err(ApiError::NotFound("not a file".into()));
    }

    let download_forced = matches!(
        query.download.as_deref(),
        Some("1") | Some("true") | Some("yes")
    );
    let has_range = request_headers.contains_key(header::RANGE);

    // Social-preview bots get an unfurl page instead of the binary.
    if download_forced
        && !has_range
        && is_preview_bot(&request_headers)
    {
        let count = stats.download_count(&rel).await;
        let page = unfurl_page(&rel, metadata.len(), count);
        return Ok(Html(page).into_response());
    }

    // Playlists are rewritten so segment URIs stay inside the API.
    let lowered = rel.to_lowercase();
    if lowered.ends_with(".m3u8") || lowered.ends_with(".m3u") {
        let content = fs::read_to_string(&target).await?;
        let rewritten = rewrite_playlist(&content, &rel);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&content_type_for(&rel))
                .map_err(|_| ApiError::Internal("invalid mime".into()))?,
        );
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        return Ok((StatusCode::OK, headers, rewritten).into_response());
    }

    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type_for(&rel))
            .map_err(|_| ApiError::Internal("invalid mime".into()))?,
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(modified) = modified {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
    }
    let etag = etag_from(&metadata);
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    if download_forced {
        let encoded = utf8_percent_encode(file_name_of(&rel), NON_ALPHANUMERIC).to_string();
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename*=UTF-8''{encoded}"))
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
    }

    // A stale If-Range validator downgrades to a full response.
    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => {
            if value.starts_with("W/") || value.starts_with('"') {
                value == etag
            } else {
                match parse_http_date(value) {
                    Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
                    Err(_) => false,
                }
            }
        }
        None => true,
    };

    let range = if if_range_matches && has_range {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = %rel, start, end, length, "range request");
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&length.to_string())
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
        if method == Method::HEAD {
            return Ok((StatusCode::PARTIAL_CONTENT, headers).into_response());
        }
        let mut file = File::open(&target).await?;
        file.seek(SeekFrom::Start(start)).await?;
        if start == 0 {
            stats.record_download(&rel, length).await;
        }
        let stream = ReaderStream::new(file.take(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&file_size.to_string())
            .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers).into_response());
    }

    info!(path = %rel, size = file_size, "download full file");
    stats.record_download(&rel, file_size).await;
    let file = File::open(&target).await?;
    let stream = ReaderStream::new(file);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response())
}

/// 创建目录（含父级）。
pub async fn create_directory(
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(auth): Extension<Arc<Auth>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<MkdirBody>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let user = require_auth(&headers, &auth).await?;
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("fileops", &ip).await?;

    if payload.path.trim().is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    let target = guard.resolve_write(&payload.path).await?;
    fs::create_dir_all(&target).await?;
    info!(username = %user.username, path = %payload.path, "create directory");
    Ok(JsonResponse(json!({ "ok": true })))
}

/// 重命名或移动文件（目标使用写模式解析）。
pub async fn rename_entry(
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(auth): Extension<Arc<Auth>>,
    Extension(blocklist): Extension<Arc<BlockList>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<RenameBody>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let user = require_auth(&headers, &auth).await?;
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("fileops", &ip).await?;

    let source = guard.resolve_read(&payload.from).await?;
    let source_rel = guard.relative_of(&source).ok_or(ApiError::PathDenied)?;
    if blocklist.is_blocked(&source, &source_rel).await {
        return Err(ApiError::Blocked);
    }
    let target = guard.resolve_write(&payload.to).await?;
    let target_rel = guard.relative_of(&target).ok_or(ApiError::PathDenied)?;
    if blocklist.is_blocked(&target, &target_rel).await {
        return Err(ApiError::Blocked);
    }
    if fs::metadata(&target).await.is_ok() {
        return Err(ApiError::BadRequest("target already exists".into()));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(&source, &target).await?;
    info!(username = %user.username, from = %source_rel, to = %target_rel, "rename");
    Ok(JsonResponse(json!({ "ok": true, "path": target_rel })))
}

/// 删除文件或目录（需要二级权限）。
pub async fn delete_entry(
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(auth): Extension<Arc<Auth>>,
    Extension(blocklist): Extension<Arc<BlockList>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(disk): Extension<Arc<DiskMonitor>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<DeleteBody>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let user = require_auth(&headers, &auth).await?;
    if user.op_level < 2 {
        return Err(ApiError::Forbidden("insufficient privileges".into()));
    }
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("fileops", &ip).await?;

    let target = guard.resolve_read(&payload.path).await?;
    let rel = guard.relative_of(&target).ok_or(ApiError::PathDenied)?;
    if blocklist.is_blocked(&target, &rel).await {
        return Err(ApiError::Blocked);
    }
    let metadata = fs::metadata(&target).await?;
    if metadata.is_dir() {
        fs::remove_dir_all(&target).await?;
    } else {
        fs::remove_file(&target).await?;
    }
    disk.invalidate().await;
    info!(username = %user.username, path = %rel, "delete entry");
    Ok(JsonResponse(json!({ "ok": true })))
}

/// 解析单个 Range 规格；非法或越界返回 416。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    };
    if range.contains(',') {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default().trim();
    let end_part = parts.next().unwrap_or_default().trim();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}

fn etag_from(metadata: &std::fs::Metadata) -> String {
    let size = metadata.len();
    if let Ok(modified) = metadata.modified()
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{size}\"")
}

fn file_name_of(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

fn is_preview_bot(headers: &HeaderMap) -> bool {
    let Some(ua) = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let ua = ua.to_lowercase();
    PREVIEW_BOTS.iter().any(|bot| ua.contains(bot))
}

fn unfurl_page(rel: &str, size: u64, downloads: u64) -> String {
    let name = file_name_of(rel);
    let encoded = utf8_percent_encode(rel, NON_ALPHANUMERIC);
    let description = format!("{} · {} downloads", human_size(size), downloads);
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>{name}</title>
<meta property="og:title" content="{name}">
<meta property="og:description" content="{description}">
<meta property="og:type" content="website">
<meta property="og:url" content="/api/file?path={encoded}&amp;download=1">
<meta name="twitter:card" content="summary">
<meta name="twitter:title" content="{name}">
<meta name="twitter:description" content="{description}">
</head>
<body><h1>{name}</h1><p>{description}</p></body>
</html>
"#
    )
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

static URI_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"URI="([^"]*)""#).expect("static regex"));

/// Rewrite playlist URIs so players resolve segments through the API.
/// External, absolute, data and blob URIs pass through untouched.
pub fn rewrite_playlist(content: &str, playlist_rel: &str) -> String {
    let base = match playlist_rel.rfind('/') {
        Some(pos) => &playlist_rel[..pos],
        None => "",
    };
    let mut out = String::with_capacity(content.len() + 256);
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            let rewritten = URI_ATTR.replace_all(line, |caps: &regex::Captures<'_>| {
                let uri = &caps[1];
                if is_external_uri(uri) {
                    format!(r#"URI="{uri}""#)
                } else {
                    format!(r#"URI="{}""#, api_uri(base, uri))
                }
            });
            out.push_str(&rewritten);
        } else if trimmed.is_empty() || is_external_uri(trimmed) {
            out.push_str(line);
        } else {
            out.push_str(&api_uri(base, trimmed));
        }
        out.push('\n');
    }
    out
}

fn is_external_uri(uri: &str) -> bool {
    uri.contains("://") || uri.starts_with("data:") || uri.starts_with("blob:") || uri.starts_with("//")
}

fn api_uri(base: &str, uri: &str) -> String {
    let joined = join_playlist_path(base, uri);
    format!(
        "/api/file?path={}",
        utf8_percent_encode(&joined, NON_ALPHANUMERIC)
    )
}

/// Resolve a playlist-relative URI against the playlist's directory.
fn join_playlist_path(base: &str, uri: &str) -> String {
    let uri = uri.trim_start_matches("./");
    if uri.starts_with('/') {
        return uri.trim_start_matches('/').to_string();
    }
    let mut segments: Vec<&str> = if base.is_empty() {
        Vec::new()
    } else {
        base.split('/').collect()
    };
    for segment in uri.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn range_of(spec: &str, size: u64) -> Result<Option<(u64, u64)>, ApiError> {
        let value = HeaderValue::from_str(spec).expect("header value");
        parse_range(Some(&value), size)
    }

    #[test]
    fn range_basic_forms() {
        assert_eq!(range_of("bytes=2-5", 10).expect("ok"), Some((2, 5)));
        assert_eq!(range_of("bytes=3-", 10).expect("ok"), Some((3, 9)));
        assert_eq!(range_of("bytes=-4", 10).expect("ok"), Some((6, 9)));
        assert_eq!(range_of("bytes=0-999", 10).expect("clamped"), Some((0, 9)));
    }

    #[test]
    fn range_rejects_invalid_specs() {
        assert!(range_of("bytes=5-2", 10).is_err());
        assert!(range_of("bytes=10-", 10).is_err());
        assert!(range_of("bytes=0-1,3-4", 10).is_err());
        assert!(range_of("items=0-1", 10).is_err());
        assert!(range_of("bytes=a-b", 10).is_err());
        assert!(range_of("bytes=0-0", 0).is_err());
    }

    #[test]
    fn range_absent_is_full_body() {
        assert_eq!(parse_range(None, 10).expect("ok"), None);
    }

    #[test]
    fn playlist_rewrites_relative_segments() {
        let playlist = "#EXTM3U\n#EXTINF:10,\nseg_00000.ts\n#EXTINF:10,\nsub/seg_00001.ts\n";
        let out = rewrite_playlist(playlist, "videos/movie.m3u8");
        assert!(out.contains("/api/file?path=videos%2Fseg%5F00000%2Ets"));
        assert!(out.contains("/api/file?path=videos%2Fsub%2Fseg%5F00001%2Ets"));
        assert!(out.starts_with("#EXTM3U\n"));
    }

    #[test]
    fn playlist_keeps_external_uris() {
        let playlist = "#EXTM3U\nhttps://cdn.example.com/seg.ts\ndata:application/json;base64,xx\n";
        let out = rewrite_playlist(playlist, "a.m3u8");
        assert!(out.contains("https://cdn.example.com/seg.ts"));
        assert!(out.contains("data:application/json;base64,xx"));
    }

    #[test]
    fn playlist_rewrites_uri_attributes_in_comments() {
        let playlist = r#"#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aud",URI="audio/a.m3u8",NAME="en""#;
        let out = rewrite_playlist(playlist, "videos/movie.m3u8");
        assert!(out.contains(r#"GROUP-ID="aud""#), "other attributes survive");
        assert!(out.contains("URI=\"/api/file?path=videos%2Faudio%2Fa%2Em3u8\""));
        assert!(out.contains(r#"NAME="en""#));
    }

    #[test]
    fn playlist_parent_traversal_stays_relative() {
        assert_eq!(join_playlist_path("a/b", "../x.ts"), "a/x.ts");
        assert_eq!(join_playlist_path("", "x.ts"), "x.ts");
        assert_eq!(join_playlist_path("a", "/root.ts"), "root.ts");
    }

    #[test]
    fn preview_bot_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (compatible; Discordbot/2.0)"),
        );
        assert!(is_preview_bot(&headers));

        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 Firefox/130.0"),
        );
        assert!(!is_preview_bot(&headers));
    }

    #[test]
    fn unfurl_page_carries_metadata() {
        let page = unfurl_page("docs/report.pdf", 2048, 7);
        assert!(page.contains("og:title"));
        assert!(page.contains("report.pdf"));
        assert!(page.contains("7 downloads"));
        assert!(page.contains("2.0 KB"));
    }

    #[test]
    fn human_size_formats() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }
}
