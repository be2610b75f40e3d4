//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde_json::json;
use std::io::ErrorKind;

use crate::pathguard::PathError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    RangeNotSatisfiable(u64),
    Unauthorized(String),
    Forbidden(String),
    PathDenied,
    Blocked,
    QuotaExceeded { disk_scope: bool },
    RateLimited(u64),
    TranscoderMissing,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::PathDenied => StatusCode::FORBIDDEN,
            ApiError::Blocked => StatusCode::FORBIDDEN,
            ApiError::QuotaExceeded { disk_scope: false } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::QuotaExceeded { disk_scope: true } => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::TranscoderMissing => StatusCode::NOT_IMPLEMENTED,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Internal(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg) => msg.clone(),
            ApiError::RangeNotSatisfiable(_) => "range not satisfiable".into(),
            ApiError::PathDenied => "Not found or access denied".into(),
            ApiError::Blocked => "blocked".into(),
            ApiError::QuotaExceeded { disk_scope: false } => "quota exceeded".into(),
            ApiError::QuotaExceeded { disk_scope: true } => "insufficient storage".into(),
            ApiError::RateLimited(_) => "too many requests".into(),
            ApiError::TranscoderMissing => "transcoder unavailable".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        match &self {
            ApiError::RangeNotSatisfiable(size) => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            ApiError::RateLimited(retry_after) => {
                if *retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
            }
            _ => {}
        }
        let body = JsonResponse(json!({ "error": self.message() }));
        (self.status(), headers, body).into_response()
    }
}

impl From<PathError> for ApiError {
    fn from(_: PathError) -> Self {
        ApiError::PathDenied
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound("not found".into()),
            _ => ApiError::Internal("io error".into()),
        }
    }
}
