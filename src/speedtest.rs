//! 测速接口：生成下载流与统计上传吞吐。

use axum::body::Body as AxumBody;
use axum::extract::Query;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;

const CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_SIZE: u64 = 10 * 1024 * 1024;
const MAX_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Deserialize)]
pub(crate) struct DownloadQuery {
    size: Option<u64>,
}

/// 下载测速：返回指定大小的零填充流。
pub async fn speedtest_download(
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let size = query.size.unwrap_or(DEFAULT_SIZE).min(MAX_SIZE);
    let full_chunks = size / CHUNK_SIZE as u64;
    let remainder = (size % CHUNK_SIZE as u64) as usize;

    let zeros = Bytes::from(vec![0u8; CHUNK_SIZE]);
    let stream = stream::iter(0..=full_chunks).filter_map(move |index| {
        let zeros = zeros.clone();
        async move {
            if index < full_chunks {
                Some(Ok::<_, std::io::Error>(zeros))
            } else if remainder > 0 {
                Some(Ok(zeros.slice(..remainder)))
            } else {
                None
            }
        }
    });

    let mut response = (StatusCode::OK, AxumBody::from_stream(stream)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response.headers_mut().insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    Ok(response)
}

/// 上传测速：读完请求体并返回接收字节数。
pub async fn speedtest_upload(body: AxumBody) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let mut stream = body.into_data_stream();
    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| ApiError::BadRequest("upload stream interrupted".into()))?;
        received += chunk.len() as u64;
    }
    Ok(JsonResponse(json!({ "ok": true, "bytes": received })))
}
