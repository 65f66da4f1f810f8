//! 目录元数据与处理器。目录只有一层父子关系，删除为软删除。

use axum::extract::{Extension, Json, Path, Query};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::auth::Principal;
use crate::blob::BlobCoordinator;
use crate::db::Database;
use crate::error::ApiError;
use crate::metadata::{FileView, MetadataError};

pub const MAX_FOLDER_NAME_CHARS: usize = 100;

const FOLDER_COLUMNS: &str = "id, name, parent_id, created_by, created_at";

/// 未删除的目录。
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderWithFiles {
    #[serde(flatten)]
    pub folder: FolderRecord,
    pub files: Vec<FileView>,
}

#[derive(Debug, Clone)]
pub struct FolderRepository {
    pool: SqlitePool,
}

impl FolderRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// 未删除的目录；指定 `parent_id` 时只返回其直接子目录。
    pub async fn list(&self, parent_id: Option<i64>) -> Result<Vec<FolderRecord>, MetadataError> {
        let sql = format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE is_deleted = 0 \
             AND (? IS NULL OR parent_id = ?) ORDER BY name, id"
        );
        let folders = sqlx::query_as::<_, FolderRecord>(&sql)
            .bind(parent_id)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(folders)
    }

    pub async fn get(&self, id: i64) -> Result<Option<FolderRecord>, MetadataError> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ? AND is_deleted = 0");
        let folder = sqlx::query_as::<_, FolderRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(folder)
    }

    pub async fn create(
        &self,
        name: &str,
        parent_id: Option<i64>,
        created_by: &str,
    ) -> Result<FolderRecord, MetadataError> {
        let sql = format!(
            "INSERT INTO folders (name, parent_id, created_by, created_at) VALUES (?, ?, ?, ?) \
             RETURNING {FOLDER_COLUMNS}"
        );
        let folder = sqlx::query_as::<_, FolderRecord>(&sql)
            .bind(name)
            .bind(parent_id)
            .bind(created_by)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(folder)
    }

    pub async fn update(
        &self,
        id: i64,
        name: &str,
        parent_id: Option<i64>,
    ) -> Result<Option<FolderRecord>, MetadataError> {
        let sql = format!(
            "UPDATE folders SET name = ?, parent_id = ? WHERE id = ? AND is_deleted = 0 \
             RETURNING {FOLDER_COLUMNS}"
        );
        let folder = sqlx::query_as::<_, FolderRecord>(&sql)
            .bind(name)
            .bind(parent_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(folder)
    }

    /// 返回是否有记录被标记。
    pub async fn soft_delete(&self, id: i64) -> Result<bool, MetadataError> {
        let result = sqlx::query(
            "UPDATE folders SET is_deleted = 1, deleted_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FolderQuery {
    parent_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FolderPayload {
    name: String,
    parent_id: Option<i64>,
}

pub async fn list_folders(
    Query(query): Query<FolderQuery>,
    Extension(folders): Extension<Arc<FolderRepository>>,
) -> Result<JsonResponse<Vec<FolderRecord>>, ApiError> {
    Ok(JsonResponse(folders.list(query.parent_id).await?))
}

pub async fn list_folders_with_files(
    Extension(folders): Extension<Arc<FolderRepository>>,
    Extension(coordinator): Extension<Arc<BlobCoordinator>>,
    Extension(principal): Extension<Principal>,
) -> Result<JsonResponse<Vec<FolderWithFiles>>, ApiError> {
    let requester = principal.requester();
    let mut result = Vec::new();
    for folder in folders.list(None).await? {
        let files = coordinator.list_in_folder(folder.id, &requester).await?;
        result.push(FolderWithFiles {
            folder,
            files: files.iter().map(FileView::from).collect(),
        });
    }
    Ok(JsonResponse(result))
}

pub async fn get_folder(
    Path(id): Path<i64>,
    Extension(folders): Extension<Arc<FolderRepository>>,
) -> Result<JsonResponse<FolderRecord>, ApiError> {
    let folder = folders.get(id).await?.ok_or_else(|| folder_not_found(id))?;
    Ok(JsonResponse(folder))
}

pub async fn get_folder_with_files(
    Path(id): Path<i64>,
    Extension(folders): Extension<Arc<FolderRepository>>,
    Extension(coordinator): Extension<Arc<BlobCoordinator>>,
    Extension(principal): Extension<Principal>,
) -> Result<JsonResponse<FolderWithFiles>, ApiError> {
    let folder = folders.get(id).await?.ok_or_else(|| folder_not_found(id))?;
    let files = coordinator
        .list_in_folder(id, &principal.requester())
        .await?;
    Ok(JsonResponse(FolderWithFiles {
        folder,
        files: files.iter().map(FileView::from).collect(),
    }))
}

/// 创建目录，任何登录用户都可以。
pub async fn create_folder(
    Extension(folders): Extension<Arc<FolderRepository>>,
    Extension(principal): Extension<Principal>,
    Json(payload): Json<FolderPayload>,
) -> Result<(StatusCode, JsonResponse<FolderRecord>), ApiError> {
    let name = validate_name(&payload.name)?;
    ensure_parent_active(&folders, payload.parent_id).await?;
    let folder = folders
        .create(&name, payload.parent_id, &principal.user_id)
        .await?;
    info!(folder_id = folder.id, user = %principal.user_id, "folder created");
    Ok((StatusCode::CREATED, JsonResponse(folder)))
}

/// 修改名称或父目录，仅管理员。
pub async fn update_folder(
    Path(id): Path<i64>,
    Extension(folders): Extension<Arc<FolderRepository>>,
    Extension(principal): Extension<Principal>,
    Json(payload): Json<FolderPayload>,
) -> Result<JsonResponse<FolderRecord>, ApiError> {
    require_admin(&principal)?;
    let name = validate_name(&payload.name)?;
    if payload.parent_id == Some(id) {
        return Err(ApiError::BadRequest("folder cannot be its own parent".into()));
    }
    ensure_parent_active(&folders, payload.parent_id).await?;
    let folder = folders
        .update(id, &name, payload.parent_id)
        .await?
        .ok_or_else(|| folder_not_found(id))?;
    info!(folder_id = id, user = %principal.user_id, "folder updated");
    Ok(JsonResponse(folder))
}

/// 软删除目录，仅管理员。
pub async fn delete_folder(
    Path(id): Path<i64>,
    Extension(folders): Extension<Arc<FolderRepository>>,
    Extension(principal): Extension<Principal>,
) -> Result<StatusCode, ApiError> {
    require_admin(&principal)?;
    if !folders.soft_delete(id).await? {
        return Err(folder_not_found(id));
    }
    info!(folder_id = id, user = %principal.user_id, "folder deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn validate_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("folder name is required".into()));
    }
    if name.chars().count() > MAX_FOLDER_NAME_CHARS {
        return Err(ApiError::BadRequest(format!(
            "folder name is longer than {MAX_FOLDER_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

async fn ensure_parent_active(
    folders: &FolderRepository,
    parent_id: Option<i64>,
) -> Result<(), ApiError> {
    if let Some(parent_id) = parent_id
        && folders.get(parent_id).await?.is_none()
    {
        return Err(ApiError::BadRequest(format!(
            "parent folder {parent_id} does not exist"
        )));
    }
    Ok(())
}

fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin role required".into()))
    }
}

fn folder_not_found(id: i64) -> ApiError {
    ApiError::NotFound(format!("folder {id} not found"))
}
