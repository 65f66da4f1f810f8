//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::blob::BlobError;
use crate::metadata::MetadataError;

const INTERNAL_MESSAGE: &str = "internal error";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(HeaderMap),
    Forbidden(String),
    Conflict(String),
    /// 内部原因只写日志，响应体固定为 `internal error`。
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::Internal(cause) => {
                error!(cause = %cause, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE).into_response()
            }
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(error: BlobError) -> Self {
        match error {
            BlobError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BlobError::NotFound(_) => ApiError::NotFound("file not found".into()),
            BlobError::PermissionDenied => ApiError::Forbidden("forbidden".into()),
            BlobError::AlreadyDeleted(_) => ApiError::Conflict("file already deleted".into()),
            err @ (BlobError::StorageWriteFailed(_)
            | BlobError::MetadataWriteFailed(_)
            | BlobError::MetadataReadFailed(_)
            | BlobError::StorageInconsistent(_)
            | BlobError::StorageReadFailed(_)) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(error: MetadataError) -> Self {
        ApiError::Internal(error.to_string())
    }
}
