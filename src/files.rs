//! 文件上传、列表、元数据、下载与删除处理器。

use axum::extract::{Extension, Multipart, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::auth::Principal;
use crate::blob::{BlobCoordinator, Removal, StoreRequest};
use crate::error::ApiError;
use crate::metadata::FileView;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadQuery {
    folder_id: Option<i64>,
}

/// 上传文件：取第一个带文件名的 multipart 字段，流式写入。
pub async fn upload_file(
    Query(query): Query<UploadQuery>,
    Extension(coordinator): Extension<Arc<BlobCoordinator>>,
    Extension(principal): Extension<Principal>,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<FileView>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(&file_name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        let request = StoreRequest {
            display_name: file_name,
            content_type,
            owner_id: principal.user_id.clone(),
            folder_id: query.folder_id,
            declared_len: None,
        };

        let stream = field.map(|chunk| chunk.map_err(io::Error::other));
        let reader = StreamReader::new(stream);
        tokio::pin!(reader);
        let record = coordinator.store(request, reader).await?;
        info!(file_id = record.id, owner = %record.owner_id, "upload complete");
        return Ok((StatusCode::CREATED, JsonResponse(FileView::from(&record))));
    }
    Err(ApiError::BadRequest("file field is required".into()))
}

/// 当前用户的文件，按创建时间倒序。
pub async fn list_files(
    Extension(coordinator): Extension<Arc<BlobCoordinator>>,
    Extension(principal): Extension<Principal>,
) -> Result<JsonResponse<Vec<FileView>>, ApiError> {
    let records = coordinator.list_owned(&principal.user_id).await?;
    Ok(JsonResponse(records.iter().map(FileView::from).collect()))
}

pub async fn get_file(
    Path(id): Path<i64>,
    Extension(coordinator): Extension<Arc<BlobCoordinator>>,
    Extension(principal): Extension<Principal>,
) -> Result<JsonResponse<FileView>, ApiError> {
    let record = coordinator.describe(id, &principal.requester()).await?;
    Ok(JsonResponse(FileView::from(&record)))
}

/// 下载文件内容。
pub async fn download_file(
    Path(id): Path<i64>,
    Extension(coordinator): Extension<Arc<BlobCoordinator>>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, ApiError> {
    let blob = coordinator.retrieve(id, &principal.requester()).await?;

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&blob.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&blob.display_name))
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&fmt_http_date(SystemTime::from(blob.record.created_at)))
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    info!(file_id = id, size = blob.content.len(), "download file");
    Ok((StatusCode::OK, headers, blob.content).into_response())
}

pub async fn delete_file(
    Path(id): Path<i64>,
    Extension(coordinator): Extension<Arc<BlobCoordinator>>,
    Extension(principal): Extension<Principal>,
) -> Result<StatusCode, ApiError> {
    match coordinator.remove(id, &principal.requester()).await? {
        Removal::Complete => {}
        Removal::PendingReconciliation => {
            warn!(file_id = id, "file deleted, blob cleanup deferred");
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `attachment; filename="..."; filename*=UTF-8''...`
fn content_disposition(display_name: &str) -> String {
    let fallback: String = display_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let mut encoded = String::with_capacity(display_name.len() * 3);
    for byte in display_name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
