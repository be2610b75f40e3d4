//! Canonical extension to Content-Type mapping.
//!
//! The table below is the authoritative mapping for files served out of the
//! share; anything not listed falls back to `mime_guess` and finally to
//! `application/octet-stream`. Text types carry an explicit utf-8 charset.

use std::borrow::Cow;

/// Content-Type for a share-relative path, derived from its extension.
pub fn content_type_for(path: &str) -> Cow<'static, str> {
    let ext = path
        .rsplit('.')
        .next()
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let known = match ext.as_str() {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "m3u8" => "application/vnd.apple.mpegurl",
        "m3u" => "application/x-mpegurl",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "ts" => "video/mp2t",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        _ => "",
    };
    if !known.is_empty() {
        return Cow::Borrowed(known);
    }
    match mime_guess::from_path(path).first() {
        Some(mime) => Cow::Owned(mime.essence_str().to_string()),
        None => Cow::Borrowed("application/octet-stream"),
    }
}
