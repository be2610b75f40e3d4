//! 上传处理器：multipart 摄取、限额检查与唯一命名。

use axum::extract::{Extension, Multipart, connect_info::ConnectInfo};
use axum::http::{HeaderMap, header};
use axum::response::Json as JsonResponse;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::auth::{Auth, require_auth};
use crate::blocklist::BlockList;
use crate::disk::{DiskMonitor, DiskScope};
use crate::error::ApiError;
use crate::http::{ProxyMode, client_ip};
use crate::pathguard::PathGuard;
use crate::ratelimit::RateLimiter;
use crate::settings::Settings;
use crate::stats::Stats;

/// 上传接口：表单字段 `file` 必填，`path` 为目标目录。
#[allow(clippy::too_many_arguments)]
pub async fn upload_file(
    Extension(guard): Extension<Arc<PathGuard>>,
    Extension(auth): Extension<Arc<Auth>>,
    Extension(blocklist): Extension<Arc<BlockList>>,
    Extension(settings): Extension<Arc<Settings>>,
    Extension(disk): Extension<Arc<DiskMonitor>>,
    Extension(stats): Extension<Arc<Stats>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let user = require_auth(&headers, &auth).await?;
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("upload", &ip).await?;

    let uploads = settings.module("uploads").await;
    let max_file_size = uploads
        .get("maxFileSizeBytes")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(crate::config::DEFAULT_MAX_FILE_SIZE);

    if let Some(declared) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        && declared > max_file_size
    {
        return Err(ApiError::QuotaExceeded { disk_scope: false });
    }

    let mut target_dir = String::new();
    let mut stored: Option<(String, u64)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("malformed multipart body".into()))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("path") => {
                target_dir = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("malformed path field".into()))?;
            }
            Some("file") => {
                let raw_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;
                let name = sanitize_filename(&raw_name)
                    .ok_or_else(|| ApiError::BadRequest("invalid file name".into()))?;

                let dir = resolve_target_dir(&guard, &blocklist, &target_dir).await?;
                let info = disk.info().await?;
                if info.scope == DiskScope::Quota && info.free == 0 {
                    return Err(ApiError::QuotaExceeded { disk_scope: false });
                }

                let target = unique_target(&dir, &name).await;
                let rel = guard.relative_of(&target).ok_or(ApiError::PathDenied)?;

                let mut atomic = AtomicFile::new(&target).await?;
                let mut written: u64 = 0;
                let mut field = field;
                let write_result: Result<(), ApiError> = async {
                    while let Some(chunk) = field
                        .chunk()
                        .await
                        .map_err(|_| ApiError::BadRequest("upload stream interrupted".into()))?
                    {
                        written += chunk.len() as u64;
                        if written > max_file_size {
                            return Err(ApiError::QuotaExceeded { disk_scope: false });
                        }
                        if written > info.max_upload {
                            return Err(ApiError::QuotaExceeded {
                                disk_scope: info.scope == DiskScope::Disk,
                            });
                        }
                        atomic.file_mut().write_all(&chunk).await?;
                    }
                    Ok(())
                }
                .await;

                if let Err(err) = write_result {
                    warn!(path = %rel, "upload aborted");
                    atomic.cleanup().await;
                    return Err(err);
                }
                atomic.finalize().await?;
                stored = Some((rel, written));
            }
            _ => {}
        }
    }

    let Some((rel, size)) = stored else {
        return Err(ApiError::BadRequest("file field is required".into()));
    };

    stats.record_upload(size).await;
    disk.invalidate().await;
    info!(username = %user.username, path = %rel, size, "upload complete");

    let name = rel.rsplit('/').next().unwrap_or(&rel).to_string();
    Ok(JsonResponse(json!({
        "ok": true,
        "file": { "name": name, "path": rel, "size": size },
    })))
}

async fn resolve_target_dir(
    guard: &PathGuard,
    blocklist: &BlockList,
    target_dir: &str,
) -> Result<PathBuf, ApiError> {
    let dir = if target_dir.trim().is_empty() {
        guard.root().to_path_buf()
    } else {
        let dir = guard
            .resolve_read(target_dir)
            .await
            .map_err(|_| ApiError::BadRequest("target directory not found".into()))?;
        let rel = guard.relative_of(&dir).ok_or(ApiError::PathDenied)?;
        if blocklist.is_blocked(&dir, &rel).await {
            return Err(ApiError::Blocked);
        }
        dir
    };
    let metadata = fs::metadata(&dir).await?;
    if !metadata.is_dir() {
        return Err(ApiError::BadRequest("target is not a directory".into()));
    }
    Ok(dir)
}

/// Basename only, control characters stripped, reserved characters
/// replaced, `.`/`..`/empty rejected.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim().to_string();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return None;
    }
    Some(trimmed)
}

/// Probe for a free name, appending ` (N)` before the final extension.
pub async fn unique_target(dir: &std::path::Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if fs::metadata(&candidate).await.is_err() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({counter}){ext}"));
        if fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{sanitize_filename, unique_target};
    use tempfile::tempdir;

    #[test]
    fn sanitize_keeps_basename_only() {
        assert_eq!(sanitize_filename("a/b.txt").as_deref(), Some("b.txt"));
        assert_eq!(sanitize_filename("c:\\dir\\x.bin").as_deref(), Some("x.bin"));
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(
            sanitize_filename("we*ird?na:me|.txt").as_deref(),
            Some("we_ird_na_me_.txt")
        );
    }

    #[test]
    fn sanitize_strips_control_chars_and_trims() {
        assert_eq!(
            sanitize_filename("  re\u{0001}port\u{0000}.pdf  ").as_deref(),
            Some("report.pdf")
        );
    }

    #[test]
    fn sanitize_rejects_degenerate_names() {
        assert_eq!(sanitize_filename("."), None);
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename("   "), None);
        assert_eq!(sanitize_filename("\u{0000}\u{0001}"), None);
    }

    #[tokio::test]
    async fn unique_target_probes_numbered_names() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("b.txt"), b"1").expect("seed");
        std::fs::write(temp.path().join("b (1).txt"), b"2").expect("seed");

        let target = unique_target(temp.path(), "b.txt").await;
        assert_eq!(target, temp.path().join("b (2).txt"));
    }

    #[tokio::test]
    async fn unique_target_without_extension_appends_suffix() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("README"), b"1").expect("seed");
        let target = unique_target(temp.path(), "README").await;
        assert_eq!(target, temp.path().join("README (1)"));
    }

    #[tokio::test]
    async fn unique_target_free_name_passes_through() {
        let temp = tempdir().expect("tempdir");
        let target = unique_target(temp.path(), "fresh.bin").await;
        assert_eq!(target, temp.path().join("fresh.bin"));
    }

    #[test]
    fn sanitize_dotfile_names_survive() {
        assert_eq!(sanitize_filename(".env").as_deref(), Some(".env"));
    }
}
